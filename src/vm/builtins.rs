//! Fixed-arity builtin instructions: strings, math, geometry, timing,
//! randomness and line-oriented file I/O.

use std::collections::HashMap;
use std::f64::consts::PI;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::thread;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{Op, Value};

/// Number of stack operands a builtin instruction consumes, or None if `op`
/// is not a builtin.
pub fn arity(op: Op) -> Option<usize> {
    let n = match op {
        Op::Random | Op::Timer | Op::ResetTimer => 0,
        Op::Str
        | Op::Int
        | Op::Len
        | Op::RandomN
        | Op::Sleep
        | Op::Sin
        | Op::Cos
        | Op::Tan
        | Op::Sqrt
        | Op::Abs
        | Op::Floor
        | Op::Ceil
        | Op::Round
        | Op::Exp
        | Op::Log
        | Op::Log10
        | Op::Sign
        | Op::Deg2Rad
        | Op::Rad2Deg
        | Op::ReadLine
        | Op::CloseFile
        | Op::Eof => 1,
        Op::Left
        | Op::Right
        | Op::Min
        | Op::Max
        | Op::Atan2
        | Op::Noise2D
        | Op::OpenFile
        | Op::WriteLine => 2,
        Op::Mid | Op::Clamp | Op::Lerp => 3,
        Op::Distance2D | Op::DistSq2D | Op::Angle2D => 4,
        Op::InRadius2D => 5,
        Op::Distance3D | Op::DistSq3D => 6,
        Op::InRadius3D => 7,
        _ => return None,
    };
    Some(n)
}

/// Mutable state behind the builtins.
pub(crate) struct Builtins {
    timer_zero: Instant,
    rng: StdRng,
    files: FileTable,
}

impl Builtins {
    pub fn new() -> Self {
        Self {
            timer_zero: Instant::now(),
            rng: StdRng::from_os_rng(),
            files: FileTable::default(),
        }
    }

    pub fn seed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    /// Execute a builtin on arguments given in call order.
    pub fn call(&mut self, op: Op, args: &[Value]) -> Result<Value, String> {
        let name = op.name();
        let num = |i: usize| -> Result<f64, String> {
            args[i]
                .as_float()
                .ok_or_else(|| format!("{}: expected number, got {}", name, args[i].type_name()))
        };

        let value = match op {
            // Strings and conversion
            Op::Str => Value::str(args[0].to_string()),
            Op::Int => Value::Int(to_int(&args[0])?),
            Op::Len => match &args[0] {
                Value::Str(s) => Value::Int(s.chars().count() as i64),
                Value::Array(a) => Value::Int(a.borrow().elements.len() as i64),
                Value::Dict(d) => Value::Int(d.borrow().len() as i64),
                other => return Err(format!("Len: expected string, got {}", other.type_name())),
            },
            Op::Left => {
                let s = text(&args[0], name)?;
                let n = count(&args[1], name)?;
                Value::str(s.chars().take(n).collect::<String>())
            }
            Op::Right => {
                let s = text(&args[0], name)?;
                let n = count(&args[1], name)?;
                let len = s.chars().count();
                Value::str(s.chars().skip(len.saturating_sub(n)).collect::<String>())
            }
            Op::Mid => {
                let s = text(&args[0], name)?;
                let start = (to_int(&args[1])?.max(1) - 1) as usize;
                let n = count(&args[2], name)?;
                Value::str(s.chars().skip(start).take(n).collect::<String>())
            }

            // Timing and randomness
            Op::Random => Value::Float(self.rng.random::<f64>()),
            Op::RandomN => Value::Float(self.rng.random::<f64>() * num(0)?),
            Op::Timer => Value::Float(self.timer_zero.elapsed().as_secs_f64()),
            Op::ResetTimer => {
                self.timer_zero = Instant::now();
                Value::Nil
            }
            Op::Sleep => {
                let ms = num(0)?;
                if ms > 0.0 {
                    thread::sleep(Duration::from_secs_f64(ms / 1000.0));
                }
                Value::Nil
            }

            // Math
            Op::Sin => Value::Float(num(0)?.sin()),
            Op::Cos => Value::Float(num(0)?.cos()),
            Op::Tan => Value::Float(num(0)?.tan()),
            Op::Sqrt => Value::Float(num(0)?.sqrt()),
            Op::Abs => match &args[0] {
                Value::Int(n) => Value::Int(n.wrapping_abs()),
                _ => Value::Float(num(0)?.abs()),
            },
            Op::Floor => Value::Float(num(0)?.floor()),
            Op::Ceil => Value::Float(num(0)?.ceil()),
            Op::Round => Value::Float(num(0)?.round()),
            Op::Min => pick(&args[0], &args[1], num(0)? <= num(1)?),
            Op::Max => pick(&args[0], &args[1], num(0)? >= num(1)?),
            Op::Clamp => {
                let (v, lo, hi) = (num(0)?, num(1)?, num(2)?);
                if v < lo {
                    args[1].clone()
                } else if v > hi {
                    args[2].clone()
                } else {
                    args[0].clone()
                }
            }
            Op::Lerp => {
                let (a, b, t) = (num(0)?, num(1)?, num(2)?);
                Value::Float(a + (b - a) * t)
            }
            Op::Exp => Value::Float(num(0)?.exp()),
            Op::Log => Value::Float(num(0)?.ln()),
            Op::Log10 => Value::Float(num(0)?.log10()),
            Op::Atan2 => Value::Float(num(0)?.atan2(num(1)?)),
            Op::Sign => {
                let v = num(0)?;
                Value::Int(if v > 0.0 {
                    1
                } else if v < 0.0 {
                    -1
                } else {
                    0
                })
            }
            Op::Deg2Rad => Value::Float(num(0)? * PI / 180.0),
            Op::Rad2Deg => Value::Float(num(0)? * 180.0 / PI),
            Op::Noise2D => Value::Float(value_noise(num(0)?, num(1)?)),

            // Geometry
            Op::Distance2D => Value::Float(dist_sq_2d(&num, 0)?.sqrt()),
            Op::DistSq2D => Value::Float(dist_sq_2d(&num, 0)?),
            Op::Distance3D => Value::Float(dist_sq_3d(&num, 0)?.sqrt()),
            Op::DistSq3D => Value::Float(dist_sq_3d(&num, 0)?),
            Op::InRadius2D => {
                let r = num(4)?;
                Value::Bool(dist_sq_2d(&num, 0)? <= r * r)
            }
            Op::InRadius3D => {
                let r = num(6)?;
                Value::Bool(dist_sq_3d(&num, 0)? <= r * r)
            }
            Op::Angle2D => {
                let (x1, y1, x2, y2) = (num(0)?, num(1)?, num(2)?, num(3)?);
                Value::Float((y2 - y1).atan2(x2 - x1))
            }

            // Files
            Op::OpenFile => {
                let path = text(&args[0], name)?;
                let mode = to_int(&args[1])?;
                Value::Handle(self.files.open(&path, mode)?)
            }
            Op::ReadLine => Value::str(self.files.read_line(handle(&args[0])?)?),
            Op::WriteLine => {
                self.files
                    .write_line(handle(&args[0])?, &args[1].to_string())?;
                Value::Nil
            }
            Op::CloseFile => {
                self.files.close(handle(&args[0])?);
                Value::Nil
            }
            Op::Eof => Value::Bool(self.files.eof(handle(&args[0])?)?),

            other => return Err(format!("{} is not a builtin", other.name())),
        };
        Ok(value)
    }
}

fn to_int(value: &Value) -> Result<i64, String> {
    match value {
        Value::Str(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .or_else(|_| s.parse::<f64>().map(|f| f as i64))
                .map_err(|_| format!("Int: cannot convert \"{}\"", s))
        }
        Value::Nil => Ok(0),
        other => other
            .as_int()
            .ok_or_else(|| format!("Int: cannot convert {}", other.type_name())),
    }
}

fn text(value: &Value, name: &str) -> Result<String, String> {
    match value {
        Value::Str(s) => Ok(s.to_string()),
        other => Err(format!("{}: expected string, got {}", name, other.type_name())),
    }
}

fn count(value: &Value, name: &str) -> Result<usize, String> {
    let n = value
        .as_int()
        .ok_or_else(|| format!("{}: expected number, got {}", name, value.type_name()))?;
    Ok(n.max(0) as usize)
}

fn handle(value: &Value) -> Result<u64, String> {
    match value {
        Value::Handle(h) => Ok(*h),
        Value::Int(n) if *n >= 0 => Ok(*n as u64),
        other => Err(format!("expected file handle, got {}", other.type_name())),
    }
}

fn pick(a: &Value, b: &Value, first: bool) -> Value {
    if first { a.clone() } else { b.clone() }
}

fn dist_sq_2d(num: &dyn Fn(usize) -> Result<f64, String>, at: usize) -> Result<f64, String> {
    let dx = num(at + 2)? - num(at)?;
    let dy = num(at + 3)? - num(at + 1)?;
    Ok(dx * dx + dy * dy)
}

fn dist_sq_3d(num: &dyn Fn(usize) -> Result<f64, String>, at: usize) -> Result<f64, String> {
    let dx = num(at + 3)? - num(at)?;
    let dy = num(at + 4)? - num(at + 1)?;
    let dz = num(at + 5)? - num(at + 2)?;
    Ok(dx * dx + dy * dy + dz * dz)
}

/// Smoothly interpolated lattice noise in [-1, 1]. Deterministic: the same
/// coordinates always give the same value.
fn value_noise(x: f64, y: f64) -> f64 {
    let (x0, y0) = (x.floor(), y.floor());
    let (fx, fy) = (x - x0, y - y0);
    let (ix, iy) = (x0 as i64, y0 as i64);

    let smooth = |t: f64| t * t * (3.0 - 2.0 * t);
    let (sx, sy) = (smooth(fx), smooth(fy));

    let top = lerp(lattice(ix, iy), lattice(ix + 1, iy), sx);
    let bottom = lerp(lattice(ix, iy + 1), lattice(ix + 1, iy + 1), sx);
    lerp(top, bottom, sy) * 2.0 - 1.0
}

fn lerp(a: f64, b: f64, t: f64) -> f64 {
    a + (b - a) * t
}

fn lattice(x: i64, y: i64) -> f64 {
    let mut h = (x as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ (y as u64).wrapping_mul(0xC2B2_AE3D_27D4_EB4F);
    h ^= h >> 33;
    h = h.wrapping_mul(0xFF51_AFD7_ED55_8CCD);
    h ^= h >> 33;
    (h >> 11) as f64 / (1u64 << 53) as f64
}

enum OpenFile {
    Read(BufReader<File>),
    Write(File),
}

/// Open files keyed by handle id. Ids start at 1 and are never reused.
#[derive(Default)]
struct FileTable {
    next: u64,
    files: HashMap<u64, OpenFile>,
}

impl FileTable {
    /// Mode 0 reads, 1 truncates and writes, 2 appends.
    fn open(&mut self, path: &str, mode: i64) -> Result<u64, String> {
        let file = match mode {
            0 => File::open(path).map(|f| OpenFile::Read(BufReader::new(f))),
            1 => File::create(path).map(OpenFile::Write),
            2 => OpenOptions::new()
                .append(true)
                .create(true)
                .open(path)
                .map(OpenFile::Write),
            other => return Err(format!("OpenFile: invalid mode {}", other)),
        }
        .map_err(|e| format!("OpenFile: cannot open {}: {}", path, e))?;

        self.next += 1;
        self.files.insert(self.next, file);
        Ok(self.next)
    }

    fn read_line(&mut self, handle: u64) -> Result<String, String> {
        match self.files.get_mut(&handle) {
            Some(OpenFile::Read(reader)) => {
                let mut line = String::new();
                reader
                    .read_line(&mut line)
                    .map_err(|e| format!("ReadLine: {}", e))?;
                let trimmed = line.trim_end_matches(['\n', '\r']).len();
                line.truncate(trimmed);
                Ok(line)
            }
            Some(OpenFile::Write(_)) => Err("ReadLine: file is open for writing".to_string()),
            None => Err(format!("ReadLine: invalid file handle {}", handle)),
        }
    }

    fn write_line(&mut self, handle: u64, text: &str) -> Result<(), String> {
        match self.files.get_mut(&handle) {
            Some(OpenFile::Write(file)) => {
                writeln!(file, "{}", text).map_err(|e| format!("WriteLine: {}", e))
            }
            Some(OpenFile::Read(_)) => Err("WriteLine: file is open for reading".to_string()),
            None => Err(format!("WriteLine: invalid file handle {}", handle)),
        }
    }

    fn eof(&mut self, handle: u64) -> Result<bool, String> {
        match self.files.get_mut(&handle) {
            Some(OpenFile::Read(reader)) => reader
                .fill_buf()
                .map(|buf| buf.is_empty())
                .map_err(|e| format!("EOF: {}", e)),
            Some(OpenFile::Write(_)) => Ok(true),
            None => Err(format!("EOF: invalid file handle {}", handle)),
        }
    }

    fn close(&mut self, handle: u64) {
        self.files.remove(&handle);
    }
}
