//! The bytecode cache: compiled scripts saved next to their source, so they can be run without
//! compiling them again.
//!
//! The format is line-oriented text. A chunk is one header line followed by its constants:
//!
//! ```text
//! CHUNK|<code as hex>|<line of every byte, comma-separated>|<number of constants>
//! NUMBER|42
//! STRING|hello\nworld
//! FUNC|greet|1|0
//! CHUNK|...            (the function's own chunk)
//! END_FUNC
//! ```
//!
//! Ints and Floats share the `NUMBER` tag. A Float is always written with a `.`, an exponent,
//! `inf` or `NaN`, so the two can be told apart when reading.
//!
//! ```
//! let script = blox::compiler::compile("print 1 + 2.5").unwrap();
//! let text = blox::cache::serialize(&script).unwrap();
//! assert!(text.starts_with("CHUNK|"));
//! assert_eq!(script, blox::cache::deserialize(&text).unwrap());
//! ```
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::iter::Enumerate;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::str::Lines;

use thiserror::Error;

use crate::chunk::Chunk;
use crate::value::{Function, Object, Value};

/// Anything that can go wrong reading or writing the cache.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("could not access the bytecode cache: {0}")]
    Io(#[from] io::Error),
    /// The file is not a valid cache. Lines are counted from 1.
    #[error("malformed bytecode cache at line {line}: {message}")]
    Malformed { line: usize, message: String },
    #[error("a {0} cannot be stored in the bytecode cache")]
    Unsupported(&'static str),
}

/// Renders a compiled script in the cache format.
pub fn serialize(function: &Function) -> Result<String, CacheError> {
    let mut out = String::new();
    write_chunk(&mut out, &function.chunk)?;
    Ok(out)
}

/// Parses the cache format back into the compiled script.
pub fn deserialize(text: &str) -> Result<Function, CacheError> {
    let mut reader = Reader {
        lines: text.lines().enumerate(),
        line: 0,
    };
    let chunk = reader.read_chunk()?;
    if let Some((index, extra)) = reader.lines.find(|(_, line)| !line.trim().is_empty()) {
        return Err(CacheError::Malformed {
            line: index + 1,
            message: format!("unexpected trailing data {extra:?}"),
        });
    }

    Ok(Function {
        name: None,
        arity: 0,
        upvalue_count: 0,
        chunk,
    })
}

/// Where the cache of a script lives: the same path, with the cache extension.
///
/// ```
/// use std::path::Path;
/// let cache = blox::cache::cache_path_for(Path::new("games/pong.blox"), "bloxc");
/// assert_eq!(Path::new("games/pong.bloxc"), cache);
/// ```
pub fn cache_path_for(script: &Path, extension: &str) -> PathBuf {
    script.with_extension(extension)
}

/// Writes the cache file.
pub fn write_cache(path: &Path, function: &Function) -> Result<(), CacheError> {
    let text = serialize(function)?;
    fs::write(path, text)?;
    tracing::debug!(path = %path.display(), "wrote bytecode cache");
    Ok(())
}

/// Reads a cache file.
pub fn read_cache(path: &Path) -> Result<Function, CacheError> {
    let text = fs::read_to_string(path)?;
    let function = deserialize(&text)?;
    tracing::debug!(path = %path.display(), "read bytecode cache");
    Ok(function)
}

/// True when the cache exists and is at least as new as the script.
pub fn is_fresh(cache: &Path, script: &Path) -> bool {
    let modified = |path: &Path| fs::metadata(path).and_then(|meta| meta.modified()).ok();
    match (modified(cache), modified(script)) {
        (Some(cache), Some(script)) => cache >= script,
        _ => false,
    }
}

////////////////////////////////////////////// Writing /////////////////////////////////////////////

fn write_chunk(out: &mut String, chunk: &Chunk) -> Result<(), CacheError> {
    out.push_str("CHUNK|");
    for byte in chunk.code() {
        let _ = write!(out, "{byte:02x}");
    }
    out.push('|');
    let lines: Vec<String> = chunk.lines().iter().map(ToString::to_string).collect();
    out.push_str(&lines.join(","));
    let _ = writeln!(out, "|{}", chunk.constants.len());

    for constant in chunk.constants.iter() {
        write_constant(out, constant)?;
    }
    Ok(())
}

fn write_constant(out: &mut String, constant: &Value) -> Result<(), CacheError> {
    match constant {
        Value::Nil => out.push_str("NIL\n"),
        Value::Boolean(b) => {
            let _ = writeln!(out, "BOOL|{b}");
        }
        Value::Int(i) => {
            let _ = writeln!(out, "NUMBER|{i}");
        }
        // Debug formatting always keeps the fractional part.
        Value::Float(f) => {
            let _ = writeln!(out, "NUMBER|{f:?}");
        }
        Value::Obj(Object::String(string)) => {
            let _ = writeln!(out, "STRING|{}", escape(string));
        }
        Value::Obj(Object::Function(function)) => {
            let name = function.name.as_deref().unwrap_or_default();
            let _ = writeln!(
                out,
                "FUNC|{}|{}|{}",
                escape(name),
                function.arity,
                function.upvalue_count
            );
            write_chunk(out, &function.chunk)?;
            out.push_str("END_FUNC\n");
        }
        other => return Err(CacheError::Unsupported(other.type_name())),
    }
    Ok(())
}

fn escape(string: &str) -> String {
    let mut escaped = String::with_capacity(string.len());
    for c in string.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '|' => escaped.push_str("\\|"),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            c => escaped.push(c),
        }
    }
    escaped
}

////////////////////////////////////////////// Reading /////////////////////////////////////////////

struct Reader<'a> {
    lines: Enumerate<Lines<'a>>,
    /// The line last read, counting from 1.
    line: usize,
}

impl<'a> Reader<'a> {
    fn malformed(&self, message: impl Into<String>) -> CacheError {
        CacheError::Malformed {
            line: self.line,
            message: message.into(),
        }
    }

    fn next_line(&mut self) -> Result<&'a str, CacheError> {
        match self.lines.next() {
            Some((index, line)) => {
                self.line = index + 1;
                Ok(line)
            }
            None => {
                self.line += 1;
                Err(self.malformed("unexpected end of file"))
            }
        }
    }

    fn read_chunk(&mut self) -> Result<Chunk, CacheError> {
        let header = self.next_line()?;
        let fields: Vec<&str> = header.split('|').collect();
        let ["CHUNK", hex, lines, count] = fields[..] else {
            return Err(self.malformed(format!("expected a CHUNK header, found {header:?}")));
        };

        let code = self.decode_hex(hex)?;
        let lines = if lines.is_empty() {
            Vec::new()
        } else {
            lines
                .split(',')
                .map(|line| line.parse::<usize>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| self.malformed(format!("bad line number: {e}")))?
        };
        let count = count
            .parse::<usize>()
            .map_err(|e| self.malformed(format!("bad constant count: {e}")))?;

        let mut constants = Vec::with_capacity(count);
        for _ in 0..count {
            constants.push(self.read_constant()?);
        }

        Chunk::from_parts(code, &lines, constants)
            .ok_or_else(|| self.malformed("the line table does not match the code"))
    }

    fn read_constant(&mut self) -> Result<Value, CacheError> {
        let line = self.next_line()?;
        let (tag, rest) = line.split_once('|').unwrap_or((line, ""));
        match tag {
            "NIL" => Ok(Value::Nil),
            "BOOL" => match rest {
                "true" => Ok(true.into()),
                "false" => Ok(false.into()),
                other => Err(self.malformed(format!("bad boolean {other:?}"))),
            },
            "NUMBER" => self.parse_number(rest),
            "STRING" => Ok(self.unescape(rest)?.into()),
            "FUNC" => self.read_function(rest),
            other => Err(self.malformed(format!("unknown constant tag {other:?}"))),
        }
    }

    fn parse_number(&self, repr: &str) -> Result<Value, CacheError> {
        let is_float = repr.contains(|c| matches!(c, '.' | 'e' | 'E'))
            || repr.contains("inf")
            || repr.contains("NaN");
        let parsed = if is_float {
            repr.parse::<f64>().map(Value::Float).ok()
        } else {
            repr.parse::<i64>().map(Value::Int).ok()
        };
        parsed.ok_or_else(|| self.malformed(format!("bad number {repr:?}")))
    }

    /// Reads the rest of a `FUNC|name|arity|upvalues` line, the chunk, and `END_FUNC`.
    fn read_function(&mut self, header: &str) -> Result<Value, CacheError> {
        // The name is escaped, so split from the right.
        let mut fields = header.rsplitn(3, '|');
        let (Some(upvalue_count), Some(arity), Some(name)) =
            (fields.next(), fields.next(), fields.next())
        else {
            return Err(self.malformed(format!("bad function header {header:?}")));
        };
        let arity = arity
            .parse::<usize>()
            .map_err(|e| self.malformed(format!("bad arity: {e}")))?;
        let upvalue_count = upvalue_count
            .parse::<usize>()
            .map_err(|e| self.malformed(format!("bad upvalue count: {e}")))?;
        let name = self.unescape(name)?;

        let chunk = self.read_chunk()?;
        if self.next_line()? != "END_FUNC" {
            return Err(self.malformed("expected END_FUNC"));
        }

        let function = Function {
            name: Some(name.into()),
            arity,
            upvalue_count,
            chunk,
        };
        Ok(Object::Function(Rc::new(function)).into())
    }

    fn decode_hex(&self, hex: &str) -> Result<Vec<u8>, CacheError> {
        if hex.len() % 2 != 0 || !hex.is_ascii() {
            return Err(self.malformed("bytecode is not a hex string"));
        }
        (0..hex.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&hex[i..i + 2], 16))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| self.malformed(format!("bytecode is not a hex string: {e}")))
    }

    fn unescape(&self, escaped: &str) -> Result<String, CacheError> {
        let mut string = String::with_capacity(escaped.len());
        let mut chars = escaped.chars();
        while let Some(c) = chars.next() {
            if c != '\\' {
                string.push(c);
                continue;
            }
            match chars.next() {
                Some('\\') => string.push('\\'),
                Some('|') => string.push('|'),
                Some('n') => string.push('\n'),
                Some('r') => string.push('\r'),
                other => return Err(self.malformed(format!("bad escape {other:?}"))),
            }
        }
        Ok(string)
    }
}
