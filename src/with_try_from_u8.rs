/// Declares a fieldless enum that can be decoded from a `u8`.
///
/// Besides the enum itself, this generates:
///
///  - `TryFrom<u8>`, whose error is the byte that matched no variant;
///  - `COUNT`, the number of variants;
///  - `name()`, the variant's identifier as written.
///
/// Macro adapted from: <https://stackoverflow.com/a/57578431/6626414>
///
/// ```
/// blox::with_try_from_u8! {
///     #[repr(u8)]
///     #[derive(Debug, PartialEq)]
///     enum Signal {
///         Go,
///         Stop = 7,
///     }
/// }
///
/// assert_eq!(Ok(Signal::Go), Signal::try_from(0));
/// assert_eq!(Ok(Signal::Stop), Signal::try_from(7));
/// assert_eq!(Err(1), Signal::try_from(1));
/// assert_eq!(2, Signal::COUNT);
/// assert_eq!("Stop", Signal::Stop.name());
/// ```
#[macro_export]
macro_rules! with_try_from_u8 {
    ($(#[$meta:meta])* $vis:vis enum $name:ident {
        $($(#[$vmeta:meta])* $vname:ident $(= $val:expr)?,)*
    }) => {
        $(#[$meta])*
        $vis enum $name {
            $($(#[$vmeta])* $vname $(= $val)?,)*
        }

        impl $name {
            /// How many variants there are.
            #[allow(dead_code)]
            pub const COUNT: usize = [$(stringify!($vname)),*].len();

            /// The variant's name, as declared.
            #[allow(dead_code)]
            pub fn name(&self) -> &'static str {
                match self {
                    $($name::$vname => stringify!($vname),)*
                }
            }
        }

        impl std::convert::TryFrom<u8> for $name {
            /// The byte that is not a variant.
            type Error = u8;

            fn try_from(byte: u8) -> Result<Self, Self::Error> {
                $(
                    if byte == $name::$vname as u8 {
                        return Ok($name::$vname);
                    }
                )*
                Err(byte)
            }
        }
    }
}
