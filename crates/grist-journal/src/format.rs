//! Binary layout of the journal file.
//!
//! The file is a 16-byte header followed by length-delimited records:
//!
//! ```text
//! [Header: 8-byte magic, u32 format version, u32 reserved]
//! [Record 0: u32 len | payload | u64 xxh3-64 of payload]   <- witness table
//! [Record 1: u32 len | payload | u64 xxh3-64 of payload]   <- entry
//! ...
//! ```
//!
//! All integers are little-endian. The first record is always the witness
//! table (the type names registered when the file was written); every later
//! record is an entry payload as encoded by [`encode_entry`].

use grist_error::{GristError, Result};
use grist_types::{BuildResult, Depends, Id, Key, Step, Trace, TypeTag, Value};
use xxhash_rust::xxh3::xxh3_64;

/// Magic bytes identifying a grist journal.
pub const JOURNAL_MAGIC: [u8; 8] = *b"gristdb\0";

/// Bumped whenever the record layout changes; readers reject other versions.
pub const JOURNAL_FORMAT_VERSION: u32 = 1;

/// Size in bytes of the file header.
pub const JOURNAL_HEADER_SIZE: usize = 16;

/// Upper bound on a single record payload. A length above this is treated
/// as a torn tail rather than an allocation request.
pub const MAX_RECORD_LEN: usize = 1 << 30;

/// Entry status tag for `Missing`.
pub const STATUS_TAG_MISSING: u8 = 0;
/// Entry status tag for `Loaded`.
pub const STATUS_TAG_LOADED: u8 = 1;

/// A status as it may appear on disk. Constructed via `TryFrom` on the
/// in-memory status so that persisting a transient variant is caught as an
/// internal-invariant error at the conversion.
#[derive(Debug, Clone, Copy)]
pub enum PersistedStatus<'a> {
    Missing,
    Loaded(&'a BuildResult),
}

impl<'a, W> TryFrom<&'a grist_types::Status<W>> for PersistedStatus<'a> {
    type Error = GristError;

    fn try_from(status: &'a grist_types::Status<W>) -> Result<Self> {
        match status {
            grist_types::Status::Missing => Ok(Self::Missing),
            grist_types::Status::Loaded(r) => Ok(Self::Loaded(r)),
            other => Err(GristError::internal(format!(
                "attempted to persist transient status '{}'",
                other.kind()
            ))),
        }
    }
}

/// Serialize the file header.
#[must_use]
pub fn encode_header() -> [u8; JOURNAL_HEADER_SIZE] {
    let mut buf = [0u8; JOURNAL_HEADER_SIZE];
    buf[..8].copy_from_slice(&JOURNAL_MAGIC);
    buf[8..12].copy_from_slice(&JOURNAL_FORMAT_VERSION.to_le_bytes());
    buf
}

/// Validate a file header, or explain why it is unusable.
pub fn check_header(buf: &[u8]) -> Result<()> {
    if buf.len() < JOURNAL_HEADER_SIZE {
        return Err(GristError::corrupt(format!(
            "journal too small for header: {} bytes",
            buf.len()
        )));
    }
    if buf[..8] != JOURNAL_MAGIC {
        return Err(GristError::corrupt("bad journal magic"));
    }
    let version = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
    if version != JOURNAL_FORMAT_VERSION {
        return Err(GristError::corrupt(format!(
            "unsupported journal format version {version} (expected {JOURNAL_FORMAT_VERSION})"
        )));
    }
    Ok(())
}

/// Frame a payload as `len | payload | checksum`.
#[must_use]
pub fn frame_record(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 12);
    out.extend_from_slice(
        &u32::try_from(payload.len())
            .expect("record payload fits u32")
            .to_le_bytes(),
    );
    out.extend_from_slice(payload);
    out.extend_from_slice(&xxh3_64(payload).to_le_bytes());
    out
}

/// Outcome of pulling one framed record off the byte stream.
pub enum FramedRecord<'a> {
    /// A whole, checksum-valid record; the cursor has advanced past it.
    Complete(&'a [u8]),
    /// The remaining bytes do not contain a whole valid record. Replay
    /// discards everything from the cursor onwards.
    Torn(&'static str),
}

/// Pull the next framed record starting at `*cursor`, advancing the cursor
/// only on success.
pub fn next_record<'a>(buf: &'a [u8], cursor: &mut usize) -> Option<FramedRecord<'a>> {
    let rest = &buf[*cursor..];
    if rest.is_empty() {
        return None;
    }
    if rest.len() < 4 {
        return Some(FramedRecord::Torn("short_length_prefix"));
    }
    let len = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
    if len > MAX_RECORD_LEN {
        return Some(FramedRecord::Torn("implausible_length"));
    }
    let Some(framed) = rest.get(4..4 + len + 8) else {
        return Some(FramedRecord::Torn("short_body"));
    };
    let payload = &framed[..len];
    let stored = u64::from_le_bytes(framed[len..].try_into().expect("checksum is 8 bytes"));
    if xxh3_64(payload) != stored {
        return Some(FramedRecord::Torn("checksum_mismatch"));
    }
    *cursor += 4 + len + 8;
    Some(FramedRecord::Complete(payload))
}

/// Encode the witness table payload: the registered type names in tag order.
#[must_use]
pub fn encode_witness_names(names: &[String]) -> Vec<u8> {
    let mut buf = Vec::new();
    put_u32(&mut buf, u32::try_from(names.len()).expect("witness count fits u32"));
    for name in names {
        put_bytes(&mut buf, name.as_bytes());
    }
    buf
}

/// Decode a witness table payload back into type names.
pub fn decode_witness_names(payload: &[u8]) -> Result<Vec<String>> {
    let mut r = Reader::new(payload);
    let count = r.u32()? as usize;
    let mut names = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let bytes = r.bytes()?;
        let name = std::str::from_utf8(bytes)
            .map_err(|_| GristError::corrupt("witness name is not UTF-8"))?;
        names.push(name.to_owned());
    }
    r.finish()?;
    Ok(names)
}

/// Encode one `(id, key, status)` entry payload.
pub fn encode_entry(id: Id, key: &Key, status: PersistedStatus<'_>) -> Vec<u8> {
    let mut buf = Vec::new();
    put_u32(&mut buf, id.get());
    match status {
        PersistedStatus::Missing => buf.push(STATUS_TAG_MISSING),
        PersistedStatus::Loaded(_) => buf.push(STATUS_TAG_LOADED),
    }
    put_u32(&mut buf, key.tag().get());
    put_bytes(&mut buf, key.payload());
    put_bytes(&mut buf, key.display().as_bytes());
    if let PersistedStatus::Loaded(result) = status {
        put_result(&mut buf, result);
    }
    buf
}

/// A decoded entry, still in the file's id and tag space.
#[derive(Debug)]
pub struct RawEntry {
    pub id: u32,
    pub key_tag: u32,
    pub key_payload: Vec<u8>,
    pub key_display: String,
    pub result: Option<RawResult>,
}

/// A decoded result, value tag still in the file's tag space.
#[derive(Debug)]
pub struct RawResult {
    pub value_tag: u32,
    pub value_payload: Vec<u8>,
    pub built: Step,
    pub changed: Step,
    pub depends: Vec<Vec<u32>>,
    pub execution: f64,
    pub traces: Vec<Trace>,
}

impl RawResult {
    /// Rebuild a [`BuildResult`] once tags and ids have been remapped.
    #[must_use]
    pub fn into_result(self, value_tag: TypeTag, remap: impl Fn(u32) -> Id) -> BuildResult {
        BuildResult {
            value: Value::new(value_tag, self.value_payload),
            built: self.built,
            changed: self.changed,
            depends: self
                .depends
                .into_iter()
                .map(|group| Depends(group.into_iter().map(&remap).collect()))
                .collect(),
            execution: self.execution,
            traces: self.traces,
        }
    }
}

/// Decode one entry payload.
pub fn decode_entry(payload: &[u8]) -> Result<RawEntry> {
    let mut r = Reader::new(payload);
    let id = r.u32()?;
    let status_tag = r.u8()?;
    let key_tag = r.u32()?;
    let key_payload = r.bytes()?.to_vec();
    let key_display = std::str::from_utf8(r.bytes()?)
        .map_err(|_| GristError::corrupt("key display is not UTF-8"))?
        .to_owned();
    let result = match status_tag {
        STATUS_TAG_MISSING => None,
        STATUS_TAG_LOADED => Some(read_result(&mut r)?),
        other => {
            return Err(GristError::corrupt(format!(
                "unknown entry status tag {other}"
            )));
        }
    };
    r.finish()?;
    Ok(RawEntry {
        id,
        key_tag,
        key_payload,
        key_display,
        result,
    })
}

fn put_result(buf: &mut Vec<u8>, result: &BuildResult) {
    put_u32(buf, result.value.tag().get());
    put_bytes(buf, result.value.payload());
    put_u32(buf, result.built.get());
    put_u32(buf, result.changed.get());
    put_u32(buf, u32::try_from(result.depends.len()).expect("group count fits u32"));
    for group in &result.depends {
        put_u32(buf, u32::try_from(group.0.len()).expect("group size fits u32"));
        for id in &group.0 {
            put_u32(buf, id.get());
        }
    }
    put_u64(buf, result.execution.to_bits());
    put_u32(buf, u32::try_from(result.traces.len()).expect("trace count fits u32"));
    for trace in &result.traces {
        put_bytes(buf, trace.message.as_bytes());
        put_u64(buf, trace.start.to_bits());
        put_u64(buf, trace.end.to_bits());
    }
}

fn read_result(r: &mut Reader<'_>) -> Result<RawResult> {
    let value_tag = r.u32()?;
    let value_payload = r.bytes()?.to_vec();
    let built = Step::new(r.u32()?);
    let changed = Step::new(r.u32()?);
    if changed > built {
        return Err(GristError::corrupt(format!(
            "result has changed step {changed} after built step {built}"
        )));
    }
    let group_count = r.u32()? as usize;
    let mut depends = Vec::with_capacity(group_count.min(1024));
    for _ in 0..group_count {
        let len = r.u32()? as usize;
        let mut group = Vec::with_capacity(len.min(4096));
        for _ in 0..len {
            group.push(r.u32()?);
        }
        depends.push(group);
    }
    let execution = f64::from_bits(r.u64()?);
    let trace_count = r.u32()? as usize;
    let mut traces = Vec::with_capacity(trace_count.min(1024));
    for _ in 0..trace_count {
        let message = std::str::from_utf8(r.bytes()?)
            .map_err(|_| GristError::corrupt("trace message is not UTF-8"))?
            .to_owned();
        let start = f64::from_bits(r.u64()?);
        let end = f64::from_bits(r.u64()?);
        traces.push(Trace::new(message, start, end));
    }
    Ok(RawResult {
        value_tag,
        value_payload,
        built,
        changed,
        depends,
        execution,
        traces,
    })
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    put_u32(buf, u32::try_from(bytes.len()).expect("byte field fits u32"));
    buf.extend_from_slice(bytes);
}

/// Cursor over a record payload; every read is bounds-checked so a
/// checksum-valid but malformed payload surfaces as corruption, never a
/// panic.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| GristError::corrupt("record payload underrun"))?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().expect("4 bytes")))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().expect("8 bytes")))
    }

    fn bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    fn finish(self) -> Result<()> {
        if self.pos == self.buf.len() {
            Ok(())
        } else {
            Err(GristError::corrupt(format!(
                "record payload has {} trailing byte(s)",
                self.buf.len() - self.pos
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_key() -> Key {
        Key::new(TypeTag::new(3), b"main.c".to_vec(), "File \"main.c\"")
    }

    fn sample_result() -> BuildResult {
        BuildResult {
            value: Value::new(TypeTag::new(4), b"0xabc".to_vec()),
            built: Step::new(7),
            changed: Step::new(5),
            depends: vec![Depends(vec![Id::new(1), Id::new(2)]), Depends(vec![Id::new(9)])],
            execution: 0.25,
            traces: vec![Trace::new("cc -c main.c", 0.1, 0.35)],
        }
    }

    #[test]
    fn header_roundtrip() {
        let header = encode_header();
        check_header(&header).unwrap();
    }

    #[test]
    fn header_rejects_bad_magic() {
        let mut header = encode_header();
        header[0] ^= 0xff;
        assert!(matches!(
            check_header(&header),
            Err(GristError::JournalCorrupt { .. })
        ));
    }

    #[test]
    fn entry_roundtrip_loaded() {
        let key = sample_key();
        let result = sample_result();
        let payload = encode_entry(Id::new(12), &key, PersistedStatus::Loaded(&result));
        let raw = decode_entry(&payload).unwrap();
        assert_eq!(raw.id, 12);
        assert_eq!(raw.key_tag, 3);
        assert_eq!(raw.key_payload, b"main.c");
        assert_eq!(raw.key_display, "File \"main.c\"");
        let raw_result = raw.result.unwrap();
        assert_eq!(raw_result.value_tag, 4);
        assert_eq!(raw_result.built, Step::new(7));
        assert_eq!(raw_result.changed, Step::new(5));
        assert_eq!(raw_result.depends, vec![vec![1, 2], vec![9]]);
        let rebuilt = raw_result.into_result(TypeTag::new(4), Id::new);
        assert_eq!(rebuilt, result);
    }

    #[test]
    fn entry_roundtrip_missing() {
        let key = sample_key();
        let payload = encode_entry(Id::new(0), &key, PersistedStatus::Missing);
        let raw = decode_entry(&payload).unwrap();
        assert!(raw.result.is_none());
    }

    #[test]
    fn framing_detects_flipped_bit() {
        let payload = b"some record".to_vec();
        let mut framed = frame_record(&payload);
        framed[6] ^= 0x01;
        let mut cursor = 0;
        match next_record(&framed, &mut cursor).unwrap() {
            FramedRecord::Torn(reason) => assert_eq!(reason, "checksum_mismatch"),
            FramedRecord::Complete(_) => panic!("corrupt record accepted"),
        }
        assert_eq!(cursor, 0);
    }

    #[test]
    fn framing_stops_at_short_tail() {
        let framed = frame_record(b"whole record");
        let cut = framed.len() - 3;
        let mut cursor = 0;
        match next_record(&framed[..cut], &mut cursor).unwrap() {
            FramedRecord::Torn(reason) => assert_eq!(reason, "short_body"),
            FramedRecord::Complete(_) => panic!("torn record accepted"),
        }
    }

    #[test]
    fn witness_names_roundtrip() {
        let names = vec!["grist.step".to_owned(), "file".to_owned(), "oracle".to_owned()];
        let decoded = decode_witness_names(&encode_witness_names(&names)).unwrap();
        assert_eq!(decoded, names);
    }

    #[test]
    fn transient_status_is_not_persistable() {
        let status: grist_types::Status<()> = grist_types::Status::Ready(sample_result());
        let err = PersistedStatus::try_from(&status).unwrap_err();
        assert!(err.is_internal());
    }

    #[test]
    fn decoder_rejects_changed_after_built() {
        let key = sample_key();
        let mut result = sample_result();
        result.changed = Step::new(9);
        let payload = encode_entry(Id::new(1), &key, PersistedStatus::Loaded(&result));
        assert!(matches!(
            decode_entry(&payload),
            Err(GristError::JournalCorrupt { .. })
        ));
    }
}
