use crate::Event;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader, ErrorKind, Read};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, warn};
use winnow::ascii::{dec_uint, digit0, digit1, float};
use winnow::combinator::{alt, delimited, opt, preceded};
use winnow::error::ContextError;
use winnow::token::{one_of, take_till, take_while};
use winnow::Parser;

/// Header key that terminates the ASCII section.
const BINARY_DATA_FOLLOWS: &str = "BinaryDataFollows";
/// Header key carrying the tick-to-time scale factor. Required.
const CLOCK_TICK_LENGTH: &str = "BinaryDataClockTickLength";

/// Control flag: the tick counter wrapped, accumulate the offset.
const FLAG_ROLLOVER: u32 = 1;
/// Control flags: stop/start markers, informational only.
const FLAG_STOP: u32 = 2;
const FLAG_START: u32 = 3;
/// Control flag: end of measurement.
const FLAG_END_OF_MEASUREMENT: u32 = u32::MAX;

/// A numeric header value with an optional bracketed unit, e.g. `8.0 [ns]`.
#[derive(Clone, Debug, PartialEq)]
pub struct Quantity {
    pub value: f64,
    pub unit: Option<String>,
}

/// Decoded key/value metadata of a timestamp stream.
///
/// Only [`tick_length`](Self::tick_length) is semantically required
/// downstream; the remaining fields are carried for collaborators.
#[derive(Clone, Debug, PartialEq)]
pub struct Header {
    pub tick_length: Quantity,
    pub average_count_rate: Option<Quantity>,
    pub distance_det_face_to_source: Option<Quantity>,
    pub distance_det_center_to_floor: Option<Quantity>,
    pub duration_real_time: Option<Quantity>,
    pub fifo_lost_counts: Option<u64>,
    pub row_ratio_1_2: Option<f64>,
    pub row_ratio_1_3: Option<f64>,
    pub row_ratio_2_3: Option<f64>,
    pub comments: Vec<String>,
    /// Unrecognized keys, stored verbatim. First occurrence wins.
    pub extra: BTreeMap<String, String>,
}

/// A fully decoded timestamp stream.
#[derive(Clone, Debug, PartialEq)]
pub struct LmxFile {
    pub header: Header,
    /// Time-ascending pulses, in nanoseconds (ticks × tick length). Events
    /// emitted from one multi-channel mask share an identical time.
    pub events: Vec<Event<f64>>,
    /// Measurement end time, if the stream carried an end-of-measurement
    /// record before EOF.
    pub final_time: Option<f64>,
}

/// The error type returned when decoding a timestamp stream fails.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("header is missing the required `{CLOCK_TICK_LENGTH}` key")]
    MissingTickLength,
    #[error("malformed header line {0:?}")]
    MalformedHeaderLine(String),
    #[error(transparent)]
    HeaderValue(#[from] HeaderValueError),
}

/// The error type returned when a header value does not match its grammar.
#[derive(Debug)]
pub struct HeaderValueError {
    key: String,
    input: String,
    span: std::ops::Range<usize>,
}

impl HeaderValueError {
    fn from_parse(key: &str, error: winnow::error::ParseError<&str, ContextError>) -> Self {
        let input = error.input().to_string();
        let span = error.char_span();
        Self {
            key: key.to_owned(),
            input,
            span,
        }
    }
}

impl fmt::Display for HeaderValueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let title = format!("invalid value for header key `{}`", self.key);
        let message = annotate_snippets::Level::Error.title(&title).snippet(
            annotate_snippets::Snippet::source(&self.input)
                .fold(true)
                .annotation(annotate_snippets::Level::Error.span(self.span.clone())),
        );
        let renderer = annotate_snippets::Renderer::plain();
        let rendered = renderer.render(message);
        rendered.fmt(f)
    }
}

impl std::error::Error for HeaderValueError {}

// `[+-]?(\d+(\.\d*)?|\.\d+)`. Deliberately narrower than a general float
// (no exponents) to match the on-disk grammar.
fn number(input: &mut &str) -> winnow::Result<f64> {
    (
        opt(one_of(['+', '-'])),
        alt((
            (digit1, opt(('.', digit0))).void(),
            ('.', digit1).void(),
        )),
    )
        .take()
        .try_map(str::parse::<f64>)
        .parse_next(input)
}

fn quantity(input: &mut &str) -> winnow::Result<Quantity> {
    let value = number.parse_next(input)?;
    let unit = opt(preceded(
        take_while(0.., ' '),
        delimited('[', take_till(0.., ']').map(str::to_owned), ']'),
    ))
    .parse_next(input)?;

    Ok(Quantity { value, unit })
}

fn parse_quantity(key: &str, value: &str) -> Result<Option<Quantity>, HeaderValueError> {
    if value.eq_ignore_ascii_case("unknown") {
        return Ok(None);
    }
    quantity
        .parse(value)
        .map(Some)
        .map_err(|e| HeaderValueError::from_parse(key, e))
}

fn parse_float(key: &str, value: &str) -> Result<f64, HeaderValueError> {
    float::<_, f64, ContextError>
        .parse(value)
        .map_err(|e| HeaderValueError::from_parse(key, e))
}

fn parse_integer(key: &str, value: &str) -> Result<u64, HeaderValueError> {
    dec_uint::<_, u64, ContextError>
        .parse(value)
        .map_err(|e| HeaderValueError::from_parse(key, e))
}

// Header accumulator; collapsed into a `Header` once the terminator line is
// reached and the required tick length is known.
#[derive(Default)]
struct PartialHeader {
    tick_length: Option<Quantity>,
    average_count_rate: Option<Quantity>,
    distance_det_face_to_source: Option<Quantity>,
    distance_det_center_to_floor: Option<Quantity>,
    duration_real_time: Option<Quantity>,
    fifo_lost_counts: Option<u64>,
    row_ratio_1_2: Option<f64>,
    row_ratio_1_3: Option<f64>,
    row_ratio_2_3: Option<f64>,
    comments: Vec<String>,
    extra: BTreeMap<String, String>,
    seen: BTreeSet<String>,
}

impl PartialHeader {
    fn apply_line(&mut self, key: &str, value: &str) -> Result<(), HeaderValueError> {
        if key != "Comment" && !self.seen.insert(key.to_owned()) {
            warn!(key, "repeated header key; keeping the first value");
            return Ok(());
        }

        match key {
            "Comment" => self.comments.push(value.to_owned()),
            CLOCK_TICK_LENGTH => self.tick_length = parse_quantity(key, value)?,
            "AverageCountRate" => self.average_count_rate = parse_quantity(key, value)?,
            "DistanceDetFaceToSource" => {
                self.distance_det_face_to_source = parse_quantity(key, value)?;
            }
            "DistanceDetCenterToFloor" => {
                self.distance_det_center_to_floor = parse_quantity(key, value)?;
            }
            "DurationRealTime" => self.duration_real_time = parse_quantity(key, value)?,
            "FifoLostCounts" => self.fifo_lost_counts = Some(parse_integer(key, value)?),
            "RowRatio(1/2)" => self.row_ratio_1_2 = Some(parse_float(key, value)?),
            "RowRatio(1/3)" => self.row_ratio_1_3 = Some(parse_float(key, value)?),
            "RowRatio(2/3)" => self.row_ratio_2_3 = Some(parse_float(key, value)?),
            _ => {
                self.extra.insert(key.to_owned(), value.to_owned());
            }
        }

        Ok(())
    }

    fn finish(self) -> Result<Header, DecodeError> {
        let tick_length = self.tick_length.ok_or(DecodeError::MissingTickLength)?;
        Ok(Header {
            tick_length,
            average_count_rate: self.average_count_rate,
            distance_det_face_to_source: self.distance_det_face_to_source,
            distance_det_center_to_floor: self.distance_det_center_to_floor,
            duration_real_time: self.duration_real_time,
            fifo_lost_counts: self.fifo_lost_counts,
            row_ratio_1_2: self.row_ratio_1_2,
            row_ratio_1_3: self.row_ratio_1_3,
            row_ratio_2_3: self.row_ratio_2_3,
            comments: self.comments,
            extra: self.extra,
        })
    }
}

fn parse_header(reader: &mut impl BufRead) -> Result<Header, DecodeError> {
    let mut partial = PartialHeader::default();
    let mut raw = Vec::new();

    loop {
        raw.clear();
        if reader.read_until(b'\n', &mut raw)? == 0 {
            // EOF before the terminator line: no binary section follows.
            break;
        }
        let line = std::str::from_utf8(&raw)
            .map_err(|_| DecodeError::MalformedHeaderLine(String::from_utf8_lossy(&raw).into_owned()))?
            .trim_end_matches(['\n', '\r']);

        // The terminator line appears both with and without a trailing colon
        // in the wild.
        let key_part = line.split_once(':').map_or(line, |(key, _)| key).trim();
        if key_part == BINARY_DATA_FOLLOWS {
            break;
        }

        let Some((key, value)) = line.split_once(':') else {
            return Err(DecodeError::MalformedHeaderLine(line.to_owned()));
        };
        partial.apply_line(key.trim(), value.trim())?;
    }

    partial.finish()
}

// Reads one native-endian (u32, u32) record. `Ok(None)` on EOF, including a
// truncated trailing record.
fn next_record<R: Read>(reader: &mut R) -> io::Result<Option<(u32, u32)>> {
    let mut buf = [0u8; 8];
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                if filled != 0 {
                    debug!("dropping {filled} trailing bytes at end of stream");
                }
                return Ok(None);
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    let number = u32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let tick = u32::from_ne_bytes([buf[4], buf[5], buf[6], buf[7]]);
    Ok(Some((number, tick)))
}

/// Decodes a timestamp stream from an open reader.
///
/// See [`decode`] for the file-path variant and the format description.
pub fn decode_from(mut reader: impl BufRead) -> Result<LmxFile, DecodeError> {
    let header = parse_header(&mut reader)?;
    let tick_length = header.tick_length.value;

    let mut rollover: u64 = 0;
    let mut events = Vec::new();
    let mut final_time = None;

    while let Some((number, tick)) = next_record(&mut reader)? {
        if number != 0 {
            // Bit mask over 1-based channel indices; several set bits mean
            // several channels fired inside the same tick.
            let time = (u64::from(tick) + rollover) as f64 * tick_length;
            for bit in 0..32u8 {
                if number & (1u32 << bit) != 0 {
                    events.push(Event {
                        time,
                        channel: Some(bit + 1),
                    });
                }
            }
            continue;
        }

        let Some((flag, flag_tick)) = next_record(&mut reader)? else {
            break;
        };
        match flag {
            FLAG_ROLLOVER => rollover += u64::from(flag_tick),
            FLAG_STOP => debug!(tick = flag_tick, "stop marker"),
            FLAG_START => debug!(tick = flag_tick, "start marker"),
            FLAG_END_OF_MEASUREMENT => {
                final_time = Some((u64::from(flag_tick) + rollover) as f64 * tick_length);
                break;
            }
            unrecognized => {
                warn!(flag = unrecognized, "unrecognized control flag; record skipped");
            }
        }
    }

    if final_time.is_none() {
        warn!("stream ended without an end-of-measurement record");
    }

    Ok(LmxFile {
        header,
        events,
        final_time,
    })
}

/// Decodes a binary timestamp-stream file.
///
/// The format is an ASCII header of `Key: Value` lines terminated by a
/// `BinaryDataFollows` line, followed by a stream of native-endian
/// `(u32, u32)` records. A zero first field introduces a two-field control
/// record (rollover, stop/start markers, end of measurement).
///
/// The stream is read one record at a time; files are never buffered whole.
///
/// # Examples
///
/// ```no_run
/// let lmx = rossi::lmx::decode("measurement.lmx")?;
/// println!(
///     "{} events, tick length {}",
///     lmx.events.len(),
///     lmx.header.tick_length.value,
/// );
/// # Ok::<(), rossi::lmx::DecodeError>(())
/// ```
pub fn decode(path: impl AsRef<Path>) -> Result<LmxFile, DecodeError> {
    let file = File::open(path)?;
    decode_from(BufReader::new(file))
}
