//! Where probe matrices go after every iteration.
//!
//! Two sinks exist: a line oriented text dump and a msgpack dataset file
//! (zstd compressed when its name ends in `.zst`). The dataset starts with a
//! [`DatasetHeader`] followed by one [`DatasetRecord`] per iteration.

use crate::matrix::LatencyMatrix;
use crate::{Error, Result};
use cache_utils::cache_info::CacheGeometry;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, Permissions};
use std::io::{self, BufReader, BufWriter, Stdout, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const DATASET_FORMAT: &str = "prime_probe.dataset.v1";
pub const EXTENSION_ZSTD: &str = "zst";

pub trait MatrixSink {
    /// Persists one iteration before the next one starts.
    fn write_matrix(&mut self, matrix: &LatencyMatrix) -> Result<()>;

    fn close(self) -> Result<()>
    where
        Self: Sized;
}

/// `set {index}: v0,v1,...` per set.
#[derive(Debug)]
pub struct TextSink<W: Write> {
    out: W,
}

impl<W: Write> TextSink<W> {
    pub fn new(out: W) -> TextSink<W> {
        TextSink { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> MatrixSink for TextSink<W> {
    fn write_matrix(&mut self, matrix: &LatencyMatrix) -> Result<()> {
        for (set, row) in matrix.rows().enumerate() {
            write!(self.out, "set {}: ", set).map_err(Error::Output)?;
            for (way, value) in row.iter().enumerate() {
                if way > 0 {
                    self.out.write_all(b",").map_err(Error::Output)?;
                }
                write!(self.out, "{}", value).map_err(Error::Output)?;
            }
            self.out.write_all(b"\n").map_err(Error::Output)?;
        }
        Ok(())
    }

    fn close(mut self) -> Result<()> {
        self.out.flush().map_err(Error::Output)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetHeader {
    pub format: String,
    /// RFC 3339 creation time.
    pub created: String,
    pub geometry: CacheGeometry,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetRecord {
    pub id: u64,
    pub sets: usize,
    pub ways: usize,
    pub data: Vec<u32>,
}

#[derive(Serialize)]
struct RecordRef<'a> {
    id: u64,
    sets: usize,
    ways: usize,
    data: &'a [u32],
}

enum DatasetWriter {
    Plain(BufWriter<File>),
    Zstd(zstd::Encoder<'static, BufWriter<File>>),
}

impl Write for DatasetWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            DatasetWriter::Plain(w) => w.write(buf),
            DatasetWriter::Zstd(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            DatasetWriter::Plain(w) => w.flush(),
            DatasetWriter::Zstd(w) => w.flush(),
        }
    }
}

impl DatasetWriter {
    fn finish(self) -> io::Result<()> {
        match self {
            DatasetWriter::Plain(mut w) => w.flush(),
            DatasetWriter::Zstd(w) => w.finish()?.flush(),
        }
    }
}

fn is_compressed(path: &Path) -> bool {
    path.extension().is_some_and(|e| e == EXTENSION_ZSTD)
}

/// Msgpack dataset file, one record per iteration with ids counting from 0.
pub struct DatasetSink {
    path: PathBuf,
    writer: DatasetWriter,
    next_id: u64,
}

impl DatasetSink {
    /// Truncates or creates `path` with mode 0666 and writes the header.
    pub fn create(path: impl AsRef<Path>, geometry: &CacheGeometry) -> Result<DatasetSink> {
        let path = path.as_ref().to_owned();
        let file = File::create(&path).map_err(Error::Output)?;
        fs::set_permissions(&path, Permissions::from_mode(0o666)).map_err(|source| {
            Error::Chmod {
                path: path.clone(),
                source,
            }
        })?;
        let file = BufWriter::new(file);
        let writer = if is_compressed(&path) {
            DatasetWriter::Zstd(zstd::Encoder::new(file, 0).map_err(Error::Output)?)
        } else {
            DatasetWriter::Plain(file)
        };
        let mut sink = DatasetSink {
            path,
            writer,
            next_id: 0,
        };
        let header = DatasetHeader {
            format: DATASET_FORMAT.to_owned(),
            created: chrono::Local::now().to_rfc3339(),
            geometry: *geometry,
        };
        rmp_serde::encode::write_named(&mut sink.writer, &header)?;
        debug!(path = %sink.path.display(), "dataset created");
        Ok(sink)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records_written(&self) -> u64 {
        self.next_id
    }
}

impl MatrixSink for DatasetSink {
    fn write_matrix(&mut self, matrix: &LatencyMatrix) -> Result<()> {
        let record = RecordRef {
            id: self.next_id,
            sets: matrix.set_count(),
            ways: matrix.ways(),
            data: matrix.as_slice(),
        };
        rmp_serde::encode::write_named(&mut self.writer, &record)?;
        self.next_id += 1;
        Ok(())
    }

    fn close(self) -> Result<()> {
        debug!(path = %self.path.display(), records = self.next_id, "closing dataset");
        self.writer.finish().map_err(Error::Output)
    }
}

fn at_end(e: &rmp_serde::decode::Error) -> bool {
    match e {
        rmp_serde::decode::Error::InvalidMarkerRead(e) => e.kind() == io::ErrorKind::UnexpectedEof,
        _ => false,
    }
}

fn read_records<R: io::Read>(mut reader: R) -> Result<(DatasetHeader, Vec<DatasetRecord>)> {
    let header: DatasetHeader = rmp_serde::decode::from_read(&mut reader)?;
    let mut records = Vec::new();
    loop {
        match rmp_serde::decode::from_read::<_, DatasetRecord>(&mut reader) {
            Ok(record) => records.push(record),
            Err(e) if at_end(&e) => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok((header, records))
}

/// Reads a dataset written by [`DatasetSink`].
pub fn read_dataset(path: impl AsRef<Path>) -> Result<(DatasetHeader, Vec<DatasetRecord>)> {
    let path = path.as_ref();
    let file = BufReader::new(File::open(path).map_err(Error::Output)?);
    if is_compressed(path) {
        read_records(zstd::Decoder::with_buffer(file).map_err(Error::Output)?)
    } else {
        read_records(file)
    }
}

/// The sink picked on the command line.
pub enum OutputSink {
    Stdout(TextSink<Stdout>),
    Dataset(DatasetSink),
}

impl OutputSink {
    pub fn open(path: Option<&Path>, geometry: &CacheGeometry) -> Result<OutputSink> {
        match path {
            Some(path) => Ok(OutputSink::Dataset(DatasetSink::create(path, geometry)?)),
            None => Ok(OutputSink::Stdout(TextSink::new(io::stdout()))),
        }
    }
}

impl MatrixSink for OutputSink {
    fn write_matrix(&mut self, matrix: &LatencyMatrix) -> Result<()> {
        match self {
            OutputSink::Stdout(s) => s.write_matrix(matrix),
            OutputSink::Dataset(s) => s.write_matrix(matrix),
        }
    }

    fn close(self) -> Result<()> {
        match self {
            OutputSink::Stdout(s) => s.close(),
            OutputSink::Dataset(s) => s.close(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cache_utils::cache_info::CacheType;

    fn sample(seed: u32) -> LatencyMatrix {
        let mut m = LatencyMatrix::new(4, 3);
        for set in 0..4 {
            for way in 0..3 {
                unsafe { *m.slot_ptr(set, way) = seed + (set * 3 + way) as u32 };
            }
        }
        m
    }

    #[test]
    fn text_lines_per_set() {
        let mut sink = TextSink::new(Vec::new());
        sink.write_matrix(&sample(100)).unwrap();
        let text = String::from_utf8(sink.into_inner()).unwrap();
        assert_eq!(
            text,
            "set 0: 100,101,102\nset 1: 103,104,105\nset 2: 106,107,108\nset 3: 109,110,111\n"
        );
    }

    #[test]
    fn single_way_has_no_separator() {
        let mut sink = TextSink::new(Vec::new());
        sink.write_matrix(&LatencyMatrix::new(2, 1)).unwrap();
        assert_eq!(sink.into_inner(), b"set 0: 0\nset 1: 0\n");
    }

    fn check_dataset(name: &str) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(name);
        let geometry = CacheGeometry::new(64, 4, 3, 1, CacheType::Data).unwrap();

        let mut sink = DatasetSink::create(&path, &geometry).unwrap();
        for seed in [0, 1000, 2000] {
            sink.write_matrix(&sample(seed)).unwrap();
        }
        assert_eq!(sink.records_written(), 3);
        sink.close().unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o666);

        let (header, records) = read_dataset(&path).unwrap();
        assert_eq!(header.format, DATASET_FORMAT);
        assert_eq!(header.geometry, geometry);
        assert!(chrono::DateTime::parse_from_rfc3339(&header.created).is_ok());
        assert_eq!(records.len(), 3);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.id, i as u64);
            assert_eq!((record.sets, record.ways), (4, 3));
        }
        assert_eq!(records[2].data, sample(2000).as_slice());
    }

    #[test]
    fn dataset_ids_count_from_zero() {
        check_dataset("run.msgpack");
    }

    #[test]
    fn zst_suffix_compresses() {
        check_dataset("run.msgpack.zst");
    }

    #[test]
    fn missing_dataset_is_an_output_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            read_dataset(dir.path().join("absent.msgpack")),
            Err(Error::Output(_))
        ));
    }
}
