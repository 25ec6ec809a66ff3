//! Allocation trace files.
//!
//! A trace is a text file with four header lines followed by one request
//! per line:
//!
//! ```text
//! 20000        suggested heap size (informational)
//! 6            number of distinct ids
//! 12           number of operations
//! 1            weight of the trace in the totals
//! a 0 2040     alloc 2040 bytes for id 0
//! r 0 4000     realloc id 0 to 4000 bytes
//! f 0          free id 0
//! ```
//!
//! Blank lines are ignored.

use std::{fs, num::ParseIntError, path::Path, str::FromStr};

use snafu::{OptionExt as _, ResultExt as _, Snafu, ensure};

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum TraceOp {
    #[display("a {id} {size}")]
    Alloc { id: usize, size: usize },
    #[display("r {id} {size}")]
    Realloc { id: usize, size: usize },
    #[display("f {id}")]
    Free { id: usize },
}

impl TraceOp {
    pub fn id(self) -> usize {
        match self {
            Self::Alloc { id, .. } | Self::Realloc { id, .. } | Self::Free { id } => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trace {
    pub name: String,
    pub suggested_heap_size: usize,
    pub num_ids: usize,
    pub weight: usize,
    pub ops: Vec<TraceOp>,
}

#[derive(Debug, Snafu)]
pub enum ParseTraceError {
    #[snafu(display("missing header line: {field}"))]
    MissingHeader { field: &'static str },
    #[snafu(display("line {line}: invalid {field}"))]
    InvalidNumber {
        line: usize,
        field: &'static str,
        #[snafu(source)]
        source: ParseIntError,
    },
    #[snafu(display("line {line}: missing {field}"))]
    MissingField { line: usize, field: &'static str },
    #[snafu(display("line {line}: unknown operation `{op}`"))]
    UnknownOp { line: usize, op: String },
    #[snafu(display("line {line}: unexpected trailing field `{field}`"))]
    TrailingField { line: usize, field: String },
    #[snafu(display("line {line}: id {id} is out of range, num_ids={num_ids}"))]
    IdOutOfRange {
        line: usize,
        id: usize,
        num_ids: usize,
    },
    #[snafu(display("operation count mismatch: header={expected}, actual={actual}"))]
    OpCountMismatch { expected: usize, actual: usize },
}

#[derive(Debug, Snafu)]
pub enum ReadTraceError {
    #[snafu(display("failed to read trace file"))]
    Io {
        #[snafu(source)]
        source: std::io::Error,
    },
    #[snafu(display("failed to parse trace file"))]
    Parse {
        #[snafu(source)]
        source: ParseTraceError,
    },
}

fn parse_field<'a, T>(
    fields: &mut impl Iterator<Item = &'a str>,
    line: usize,
    field: &'static str,
) -> Result<T, ParseTraceError>
where
    T: FromStr<Err = ParseIntError>,
{
    fields
        .next()
        .context(MissingFieldSnafu { line, field })?
        .parse()
        .context(InvalidNumberSnafu { line, field })
}

impl Trace {
    /// Reads a trace file, naming the trace after the file name.
    pub fn read(path: &Path) -> Result<Self, ReadTraceError> {
        let text = fs::read_to_string(path).context(IoSnafu)?;
        let name = path
            .file_name()
            .map_or_else(|| path.display().to_string(), |name| name.to_string_lossy().into_owned());
        Self::parse(name, &text).context(ParseSnafu)
    }

    pub fn parse(name: impl Into<String>, text: &str) -> Result<Self, ParseTraceError> {
        let mut lines = text
            .lines()
            .enumerate()
            .map(|(index, line)| (index + 1, line.trim()))
            .filter(|(_, line)| !line.is_empty());

        let mut header = |field: &'static str| -> Result<usize, ParseTraceError> {
            let (line, text) = lines.next().context(MissingHeaderSnafu { field })?;
            parse_field(&mut text.split_whitespace(), line, field)
        };
        let suggested_heap_size = header("suggested heap size")?;
        let num_ids = header("number of ids")?;
        let num_ops = header("number of operations")?;
        let weight = header("weight")?;

        let mut ops = Vec::with_capacity(num_ops);
        for (line, text) in lines {
            let mut fields = text.split_whitespace();
            let op = fields.next().context(MissingFieldSnafu {
                line,
                field: "operation",
            })?;
            let id = parse_field(&mut fields, line, "id")?;
            let op = match op {
                "a" => TraceOp::Alloc {
                    id,
                    size: parse_field(&mut fields, line, "size")?,
                },
                "r" => TraceOp::Realloc {
                    id,
                    size: parse_field(&mut fields, line, "size")?,
                },
                "f" => TraceOp::Free { id },
                _ => return UnknownOpSnafu { line, op }.fail(),
            };
            if let Some(field) = fields.next() {
                return TrailingFieldSnafu { line, field }.fail();
            }
            ensure!(id < num_ids, IdOutOfRangeSnafu { line, id, num_ids });
            ops.push(op);
        }
        ensure!(
            ops.len() == num_ops,
            OpCountMismatchSnafu {
                expected: num_ops,
                actual: ops.len()
            }
        );

        Ok(Self {
            name: name.into(),
            suggested_heap_size,
            num_ids,
            weight,
            ops,
        })
    }
}

/// Traces compiled into the driver, replayed when no trace file is given.
pub const BUILTIN_TRACES: &[(&str, &str)] = &[
    ("short1.rep", include_str!("../traces/short1.rep")),
    ("short2.rep", include_str!("../traces/short2.rep")),
    ("coalesce.rep", include_str!("../traces/coalesce.rep")),
    ("realloc.rep", include_str!("../traces/realloc.rep")),
];
