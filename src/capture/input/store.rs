//! Durable telemetry files
//!
//! The CSV store writes a header, a static metadata row, then appends every
//! flushed batch. The end time and duration in the metadata row are zero
//! placeholders until `finish` patches that line. The JSON store keeps all
//! records in memory and writes one document on `finish`.

use super::types::{CursorSample, KeySample, RecordingInfo, TelemetryRecord};
use crate::recorder::channel::{RecordingError, RecordingResult};
use crate::recorder::state::TelemetryFormat;
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

pub const CSV_COLUMNS: [&str; 20] = [
    "display_id",
    "start_time",
    "end_time",
    "duration",
    "cursor_frame_rate",
    "video_frame_rate",
    "video_width",
    "video_height",
    "screen_x_width",
    "screen_y_height",
    "x",
    "y",
    "timestamp",
    "clicks",
    "cursor_type",
    "cursor_moving",
    "key_state",
    "key_code",
    "character",
    "modifiers",
];

const STATIC_COLUMNS: usize = 10;

pub trait TelemetryStore: Send {
    fn path(&self) -> &Path;

    /// Persist a batch. Records reach the OS before this returns.
    fn append(&mut self, records: &[TelemetryRecord]) -> RecordingResult<()>;

    /// Number of records persisted so far
    fn persisted(&self) -> u64;

    /// Close the file, stamping the end time into the metadata
    fn finish(&mut self, end_time: u64) -> RecordingResult<()>;
}

/// Open the store for `format`, creating its file now
pub fn open_store(
    format: TelemetryFormat,
    path: &Path,
    info: RecordingInfo,
) -> RecordingResult<Box<dyn TelemetryStore>> {
    Ok(match format {
        TelemetryFormat::Csv => Box::new(CsvTelemetryStore::create(path, info)?),
        TelemetryFormat::Json => Box::new(JsonTelemetryStore::create(path, info)?),
    })
}

fn telemetry_error(action: &str, path: &Path, e: impl std::fmt::Display) -> RecordingError {
    RecordingError::TelemetryFailure(format!("{action} {path:?}: {e}"))
}

fn escape_field(field: &str) -> String {
    if field.contains(|c: char| matches!(c, ',' | '"' | '\n' | '\r')) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        format!("{:.2}", value)
    }
}

pub fn static_row(info: &RecordingInfo) -> String {
    let mut fields = vec![
        info.display_id.to_string(),
        info.start_time.to_string(),
        info.end_time.to_string(),
        info.duration.to_string(),
        info.cursor_frame_rate.to_string(),
        info.video_frame_rate.to_string(),
        info.video_width.to_string(),
        info.video_height.to_string(),
        format_number(info.screen_x_width),
        format_number(info.screen_y_height),
    ];
    fields.resize(CSV_COLUMNS.len(), String::new());
    fields.join(",")
}

pub fn record_row(record: &TelemetryRecord) -> String {
    let mut fields = vec![String::new(); CSV_COLUMNS.len()];
    let dynamic = &mut fields[STATIC_COLUMNS..];
    match record {
        TelemetryRecord::Cursor(c) => {
            dynamic[0] = format_number(c.x);
            dynamic[1] = format_number(c.y);
            dynamic[2] = c.timestamp.to_string();
            dynamic[3] = c.clicks.to_string();
            dynamic[4] = c.cursor_type.as_str().to_string();
            dynamic[5] = u8::from(c.cursor_moving).to_string();
        }
        TelemetryRecord::Key(k) => {
            dynamic[2] = k.timestamp.to_string();
            dynamic[6] = k.key_state.as_str().to_string();
            dynamic[7] = k.key_code.to_string();
            dynamic[8] = escape_field(k.character.as_deref().unwrap_or(""));
            dynamic[9] = k.modifiers.0.to_string();
        }
    }
    fields.join(",")
}

pub struct CsvTelemetryStore {
    path: PathBuf,
    info: RecordingInfo,
    out: Option<BufWriter<File>>,
    persisted: u64,
}

impl CsvTelemetryStore {
    pub fn create(path: &Path, info: RecordingInfo) -> RecordingResult<Self> {
        let file = File::create(path).map_err(|e| telemetry_error("creating", path, e))?;
        let mut out = BufWriter::new(file);
        writeln!(out, "{}", CSV_COLUMNS.join(","))
            .and_then(|_| writeln!(out, "{}", static_row(&info)))
            .and_then(|_| out.flush())
            .map_err(|e| telemetry_error("writing header to", path, e))?;

        tracing::info!("Telemetry CSV created at {:?}", path);
        Ok(Self {
            path: path.to_path_buf(),
            info,
            out: Some(out),
            persisted: 0,
        })
    }

    /// Rewrite line 2 with the final metadata through a temporary file
    fn patch_static_row(&self) -> RecordingResult<()> {
        let contents = std::fs::read_to_string(&self.path)
            .map_err(|e| telemetry_error("reading back", &self.path, e))?;
        let mut lines = contents.split_inclusive('\n');
        let header = lines.next().unwrap_or("");
        let _placeholder = lines.next();

        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .map_err(|e| telemetry_error("creating temp file for", &self.path, e))?;
        {
            let mut out = BufWriter::new(tmp.as_file_mut());
            out.write_all(header.as_bytes())
                .and_then(|_| writeln!(out, "{}", static_row(&self.info)))
                .and_then(|_| lines.try_for_each(|line| out.write_all(line.as_bytes())))
                .and_then(|_| out.flush())
                .map_err(|e| telemetry_error("rewriting", &self.path, e))?;
        }
        tmp.persist(&self.path)
            .map_err(|e| telemetry_error("replacing", &self.path, e.error))?;
        Ok(())
    }
}

impl TelemetryStore for CsvTelemetryStore {
    fn path(&self) -> &Path {
        &self.path
    }

    fn append(&mut self, records: &[TelemetryRecord]) -> RecordingResult<()> {
        let Some(out) = self.out.as_mut() else {
            return Err(RecordingError::TelemetryFailure(format!(
                "{:?} already finished",
                self.path
            )));
        };
        for record in records {
            writeln!(out, "{}", record_row(record))
                .map_err(|e| telemetry_error("appending to", &self.path, e))?;
        }
        out.flush()
            .map_err(|e| telemetry_error("flushing", &self.path, e))?;
        self.persisted += records.len() as u64;
        Ok(())
    }

    fn persisted(&self) -> u64 {
        self.persisted
    }

    fn finish(&mut self, end_time: u64) -> RecordingResult<()> {
        if let Some(mut out) = self.out.take() {
            out.flush()
                .map_err(|e| telemetry_error("flushing", &self.path, e))?;
        }
        self.info.close(end_time);
        self.patch_static_row()?;
        tracing::info!(
            "Telemetry CSV finished: {} records, {} ms",
            self.persisted,
            self.info.duration
        );
        Ok(())
    }
}

#[derive(Serialize)]
struct JsonDocument<'a> {
    #[serde(rename = "RecordingInfo")]
    recording_info: &'a RecordingInfo,
    recorded_cursor_data: &'a [CursorSample],
    keyboard_data: &'a [KeySample],
}

/// Buffers everything until `finish`; a crash loses the whole run
pub struct JsonTelemetryStore {
    path: PathBuf,
    info: RecordingInfo,
    cursor: Vec<CursorSample>,
    keyboard: Vec<KeySample>,
}

impl JsonTelemetryStore {
    pub fn create(path: &Path, info: RecordingInfo) -> RecordingResult<Self> {
        File::create(path).map_err(|e| telemetry_error("creating", path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            info,
            cursor: Vec::new(),
            keyboard: Vec::new(),
        })
    }
}

impl TelemetryStore for JsonTelemetryStore {
    fn path(&self) -> &Path {
        &self.path
    }

    fn append(&mut self, records: &[TelemetryRecord]) -> RecordingResult<()> {
        for record in records {
            match record {
                TelemetryRecord::Cursor(c) => self.cursor.push(c.clone()),
                TelemetryRecord::Key(k) => self.keyboard.push(k.clone()),
            }
        }
        Ok(())
    }

    fn persisted(&self) -> u64 {
        (self.cursor.len() + self.keyboard.len()) as u64
    }

    fn finish(&mut self, end_time: u64) -> RecordingResult<()> {
        self.info.close(end_time);
        let document = JsonDocument {
            recording_info: &self.info,
            recorded_cursor_data: &self.cursor,
            keyboard_data: &self.keyboard,
        };
        let file = File::create(&self.path).map_err(|e| telemetry_error("creating", &self.path, e))?;
        let mut out = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut out, &document)?;
        out.flush()?;
        Ok(())
    }
}
