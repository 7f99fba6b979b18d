use crate::Event;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;
use thiserror::Error;

/// The error type returned when decoding a text event file fails.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("line {line}: missing column {column}")]
    MissingColumn { line: usize, column: usize },
    #[error("line {line}: invalid number {value:?}")]
    InvalidNumber { line: usize, value: String },
}

/// Decodes events from an open reader. See [`decode`].
pub fn decode_from(
    reader: impl BufRead,
    time_col: usize,
    channel_col: Option<usize>,
) -> Result<Vec<Event<f64>>, DecodeError> {
    let mut events = Vec::new();

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let line_number = index + 1;
        let fields: Vec<&str> = line.split_whitespace().collect();

        let time = field(&fields, time_col, line_number)?;
        let time = time
            .parse()
            .map_err(|_| DecodeError::InvalidNumber {
                line: line_number,
                value: time.to_owned(),
            })?;

        let channel = match channel_col {
            Some(col) => {
                let raw = field(&fields, col, line_number)?;
                Some(raw.parse().map_err(|_| DecodeError::InvalidNumber {
                    line: line_number,
                    value: raw.to_owned(),
                })?)
            }
            None => None,
        };

        events.push(Event { time, channel });
    }

    Ok(events)
}

fn field<'a>(fields: &[&'a str], column: usize, line: usize) -> Result<&'a str, DecodeError> {
    fields
        .get(column)
        .copied()
        .ok_or(DecodeError::MissingColumn { line, column })
}

/// Decodes one event per non-empty line from the given whitespace-delimited
/// columns (0-based).
///
/// No sorting and no ordering validation is performed; callers feeding the
/// coincidence engine are responsible for sorting (see
/// [`sort_by_time`](crate::sort_by_time)).
///
/// # Examples
///
/// ```no_run
/// let events = rossi::text::decode("pulses.txt", 0, Some(1))?;
/// # Ok::<(), rossi::text::DecodeError>(())
/// ```
pub fn decode(
    path: impl AsRef<Path>,
    time_col: usize,
    channel_col: Option<usize>,
) -> Result<Vec<Event<f64>>, DecodeError> {
    let file = File::open(path)?;
    decode_from(BufReader::new(file), time_col, channel_col)
}
