use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;

use regex::Regex;
use serde::{Deserialize, Serialize};

pub const EXPORT_FILENAME: &str = "data.csv";
pub const MAX_KEY_LEN: usize = 128;
pub const DEFAULT_USER_IDS_PATTERN: &str = r"^\d+(,\d+)*$";
pub const DEFAULT_ATTRIBUTES_PATTERN: &str = r"^\w+(,\w+)*$";
pub const DEFAULT_CSV_ROW_PATTERN: &str = r"^\d+,\w+,\w+$";
pub const DEFAULT_MAX_CONTENT_LENGTH: usize = 64 * 1024 * 1024;
pub const EXPORT_PARAMS_REJECTED: &str = "Get params are wrong";
pub const NO_FILE_UPLOADED: &str = "No file uploaded";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum AttrError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("{0}")]
    UploadRejected(String),
    #[error("CSV file is broken on line {line}")]
    MalformedRow { line: usize },
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("csv encoding error: {0}")]
    Encoding(String),
}

impl AttrError {
    /// HTTP-style status for surfacing this error to a caller.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest(_)
            | Self::UploadRejected(_)
            | Self::MalformedRow { .. }
            | Self::Validation(_) => 400,
            Self::Config(_) | Self::Encoding(_) => 500,
        }
    }

    #[must_use]
    pub fn payload(&self) -> Option<serde_json::Value> {
        match self {
            Self::MalformedRow { line } => Some(serde_json::json!({ "line": line })),
            _ => None,
        }
    }
}

/// Failure of an export or import run: either the input was rejected before the
/// store was touched, or the store itself failed.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError<E> {
    #[error(transparent)]
    Rejected(#[from] AttrError),
    #[error("store failure: {0}")]
    Store(E),
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Entry {
    pub user_id: i64,
    pub key: String,
    pub value: String,
}

impl Entry {
    #[must_use]
    pub fn new(user_id: i64, key: impl Into<String>, value: impl Into<String>) -> Self {
        Self { user_id, key: key.into(), value: value.into() }
    }

    /// Empty-valued stand-in for a pair with no stored entry. Never persisted.
    #[must_use]
    pub fn placeholder(pair: &LookupKey) -> Self {
        Self::new(pair.user_id, pair.attribute.clone(), String::new())
    }

    /// Check the identity columns against the storage constraints.
    ///
    /// # Errors
    /// Returns [`AttrError::Validation`] for a negative user id, an empty key, or a
    /// key longer than [`MAX_KEY_LEN`] characters.
    pub fn validate(&self) -> Result<(), AttrError> {
        if self.user_id < 0 {
            return Err(AttrError::Validation("user_id MUST be non-negative".to_string()));
        }

        if self.key.is_empty() {
            return Err(AttrError::Validation("key MUST be non-empty".to_string()));
        }

        if self.key.chars().count() > MAX_KEY_LEN {
            return Err(AttrError::Validation(format!(
                "key MUST be at most {MAX_KEY_LEN} characters"
            )));
        }

        Ok(())
    }
}

impl Display for Entry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "<Entry user_id: {}, key: {}, value: {}>", self.user_id, self.key, self.value)
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct LookupKey {
    pub user_id: i64,
    pub attribute: String,
}

impl LookupKey {
    #[must_use]
    pub fn new(user_id: i64, attribute: impl Into<String>) -> Self {
        Self { user_id, attribute: attribute.into() }
    }
}

impl Display for LookupKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.user_id, self.attribute)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct PatternConfig {
    pub user_ids: String,
    pub attributes: String,
    pub csv_row: String,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            user_ids: DEFAULT_USER_IDS_PATTERN.to_string(),
            attributes: DEFAULT_ATTRIBUTES_PATTERN.to_string(),
            csv_row: DEFAULT_CSV_ROW_PATTERN.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct UploadPolicy {
    pub allowed_extensions: BTreeSet<String>,
    pub max_content_length: usize,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            allowed_extensions: BTreeSet::from(["csv".to_string()]),
            max_content_length: DEFAULT_MAX_CONTENT_LENGTH,
        }
    }
}

impl UploadPolicy {
    /// Suffix-only check: the text after the last `.` must be an allowed extension.
    #[must_use]
    pub fn allowed_file(&self, filename: &str) -> bool {
        filename
            .rsplit_once('.')
            .is_some_and(|(_, extension)| self.allowed_extensions.contains(extension))
    }

    /// Accept or reject the filename of an uploaded file.
    ///
    /// # Errors
    /// Returns [`AttrError::UploadRejected`] when no file was sent, the filename is
    /// empty, or its extension is not allowed.
    pub fn check_upload(&self, filename: Option<&str>) -> Result<(), AttrError> {
        match filename {
            Some(name) if !name.is_empty() && self.allowed_file(name) => Ok(()),
            _ => Err(AttrError::UploadRejected(NO_FILE_UPLOADED.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub patterns: PatternConfig,
    pub upload: UploadPolicy,
    pub export_dir: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            patterns: PatternConfig::default(),
            upload: UploadPolicy::default(),
            export_dir: std::env::temp_dir(),
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Grammar {
    UserIds,
    Attributes,
    CsvRow,
}

impl Grammar {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UserIds => "user_ids",
            Self::Attributes => "attributes",
            Self::CsvRow => "csv_row",
        }
    }
}

/// The three input grammars, compiled once and matched against whole strings.
#[derive(Debug, Clone)]
pub struct Validator {
    user_ids: Regex,
    attributes: Regex,
    csv_row: Regex,
}

impl Validator {
    /// Compile the configured patterns.
    ///
    /// # Errors
    /// Returns [`AttrError::Config`] naming the first pattern that does not compile.
    pub fn new(config: &PatternConfig) -> Result<Self, AttrError> {
        Ok(Self {
            user_ids: compile_anchored(Grammar::UserIds, &config.user_ids)?,
            attributes: compile_anchored(Grammar::Attributes, &config.attributes)?,
            csv_row: compile_anchored(Grammar::CsvRow, &config.csv_row)?,
        })
    }

    #[must_use]
    pub fn matches(&self, input: &str, grammar: Grammar) -> bool {
        let pattern = match grammar {
            Grammar::UserIds => &self.user_ids,
            Grammar::Attributes => &self.attributes,
            Grammar::CsvRow => &self.csv_row,
        };
        pattern.is_match(input)
    }

    /// Validate the two export query parameters.
    ///
    /// # Errors
    /// Returns [`AttrError::InvalidRequest`] when either parameter fails its grammar.
    pub fn check_export_params(&self, user_ids: &str, attributes: &str) -> Result<(), AttrError> {
        if self.matches(user_ids, Grammar::UserIds) && self.matches(attributes, Grammar::Attributes)
        {
            Ok(())
        } else {
            Err(AttrError::InvalidRequest(EXPORT_PARAMS_REJECTED.to_string()))
        }
    }

    /// A CSV row is valid when it has exactly three fields whose comma-joined form
    /// matches the `csv_row` grammar.
    #[must_use]
    pub fn check_row(&self, fields: &[&str]) -> bool {
        fields.len() == 3 && self.matches(&fields.join(","), Grammar::CsvRow)
    }
}

fn compile_anchored(grammar: Grammar, pattern: &str) -> Result<Regex, AttrError> {
    Regex::new(&format!("^(?:{pattern})$")).map_err(|err| {
        AttrError::Config(format!("invalid {} pattern {pattern:?}: {err}", grammar.as_str()))
    })
}

/// Expand two validated comma-separated lists into their row-major cross product.
///
/// Order and duplicates are preserved. Inputs must already have passed
/// [`Validator::check_export_params`].
///
/// # Errors
/// Returns [`AttrError::InvalidRequest`] when a user id does not fit in `i64`.
pub fn expand_pairs(user_ids: &str, attributes: &str) -> Result<Vec<LookupKey>, AttrError> {
    let attributes = attributes.split(',').collect::<Vec<_>>();
    let mut pairs = Vec::new();

    for raw_id in user_ids.split(',') {
        let user_id = parse_user_id(raw_id)
            .ok_or_else(|| AttrError::InvalidRequest(EXPORT_PARAMS_REJECTED.to_string()))?;
        for attribute in &attributes {
            pairs.push(LookupKey::new(user_id, *attribute));
        }
    }

    Ok(pairs)
}

fn parse_user_id(raw: &str) -> Option<i64> {
    raw.parse::<i64>().ok().filter(|user_id| *user_id >= 0)
}

/// Persistence of entries keyed by `(user_id, key)`.
pub trait EntryStore {
    type Error;

    /// Point lookup; absence is `Ok(None)`.
    ///
    /// # Errors
    /// Returns the backend error when the lookup itself fails.
    fn get(&self, user_id: i64, key: &str) -> Result<Option<Entry>, Self::Error>;

    /// Insert or replace every entry in one all-or-nothing transaction.
    ///
    /// # Errors
    /// Returns the backend error; no entry of the batch is committed in that case.
    fn upsert_all(&mut self, entries: &[Entry]) -> Result<(), Self::Error>;

    /// Insert or replace a single entry.
    ///
    /// # Errors
    /// Returns the backend error when the write fails.
    fn upsert(&mut self, entry: &Entry) -> Result<(), Self::Error> {
        self.upsert_all(std::slice::from_ref(entry))
    }
}

/// Resolve one pair, substituting [`Entry::placeholder`] on a miss. Read-only.
///
/// # Errors
/// Returns the backend error when the lookup fails.
pub fn lookup_or_default<S>(store: &S, pair: &LookupKey) -> Result<Entry, S::Error>
where
    S: EntryStore + ?Sized,
{
    Ok(store.get(pair.user_id, &pair.attribute)?.unwrap_or_else(|| Entry::placeholder(pair)))
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CsvExport {
    pub filename: &'static str,
    pub rows: usize,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ImportSummary {
    pub rows: usize,
}

/// Build the CSV snapshot for every requested pair, one row per pair in request order.
///
/// # Errors
/// Returns [`PipelineError::Rejected`] when the parameters fail validation (the store
/// is not touched), or [`PipelineError::Store`] when a lookup fails.
pub fn export_entries<S>(
    validator: &Validator,
    store: &S,
    user_ids: &str,
    attributes: &str,
) -> Result<CsvExport, PipelineError<S::Error>>
where
    S: EntryStore + ?Sized,
{
    validator.check_export_params(user_ids, attributes)?;
    let pairs = expand_pairs(user_ids, attributes)?;

    let entries = pairs
        .iter()
        .map(|pair| lookup_or_default(store, pair))
        .collect::<Result<Vec<_>, _>>()
        .map_err(PipelineError::Store)?;

    let bytes = encode_entries(&entries)?;
    Ok(CsvExport { filename: EXPORT_FILENAME, rows: entries.len(), bytes })
}

/// Encode entries as headerless `user_id,key,value` rows.
///
/// # Errors
/// Returns [`AttrError::Encoding`] when the CSV writer fails.
pub fn encode_entries(entries: &[Entry]) -> Result<Vec<u8>, AttrError> {
    let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(Vec::new());

    for entry in entries {
        let user_id = entry.user_id.to_string();
        writer
            .write_record([user_id.as_str(), entry.key.as_str(), entry.value.as_str()])
            .map_err(|err| AttrError::Encoding(err.to_string()))?;
    }

    writer.into_inner().map_err(|err| AttrError::Encoding(err.to_string()))
}

/// Parse and validate every row of an uploaded CSV file.
///
/// Rows are physical lines numbered from zero; a trailing `\r` is ignored. Each
/// line is decoded on its own, so a blank line is a malformed row rather than
/// being skipped. The comma-joined fields of each row must match the `csv_row`
/// grammar and form a valid [`Entry`].
///
/// # Errors
/// Returns [`AttrError::MalformedRow`] for the first row that fails.
pub fn parse_rows<R: Read>(validator: &Validator, reader: R) -> Result<Vec<Entry>, AttrError> {
    let mut entries = Vec::new();

    for (line, raw) in BufReader::new(reader).split(b'\n').enumerate() {
        let entry = raw
            .ok()
            .and_then(|raw| entry_from_line(validator, &raw))
            .ok_or(AttrError::MalformedRow { line })?;
        entries.push(entry);
    }

    Ok(entries)
}

fn entry_from_line(validator: &Validator, raw: &[u8]) -> Option<Entry> {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    if raw.is_empty() {
        return None;
    }

    let mut records = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(raw)
        .into_records();
    let record = records.next()?.ok()?;
    if records.next().is_some() {
        return None;
    }

    entry_from_record(validator, &record)
}

fn entry_from_record(validator: &Validator, record: &csv::StringRecord) -> Option<Entry> {
    if !validator.check_row(&record.iter().collect::<Vec<_>>()) {
        return None;
    }

    let entry = Entry::new(parse_user_id(record.get(0)?)?, record.get(1)?, record.get(2)?);
    entry.validate().ok()?;
    Some(entry)
}

/// Validate a whole CSV file, then merge every row into the store in one transaction.
///
/// Nothing is written unless every row is valid.
///
/// # Errors
/// Returns [`PipelineError::Rejected`] with [`AttrError::MalformedRow`] for the first
/// invalid row, or [`PipelineError::Store`] when the commit fails.
pub fn import_entries<S, R>(
    validator: &Validator,
    store: &mut S,
    reader: R,
) -> Result<ImportSummary, PipelineError<S::Error>>
where
    S: EntryStore + ?Sized,
    R: Read,
{
    let entries = parse_rows(validator, reader)?;
    if entries.is_empty() {
        return Ok(ImportSummary { rows: 0 });
    }

    store.upsert_all(&entries).map_err(PipelineError::Store)?;
    Ok(ImportSummary { rows: entries.len() })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Default)]
    struct MemoryStore {
        entries: BTreeMap<(i64, String), String>,
        fail_writes: bool,
    }

    impl MemoryStore {
        fn value(&self, user_id: i64, key: &str) -> Option<&str> {
            self.entries.get(&(user_id, key.to_string())).map(String::as_str)
        }
    }

    impl EntryStore for MemoryStore {
        type Error = String;

        fn get(&self, user_id: i64, key: &str) -> Result<Option<Entry>, Self::Error> {
            Ok(self
                .entries
                .get(&(user_id, key.to_string()))
                .map(|value| Entry::new(user_id, key, value.clone())))
        }

        fn upsert_all(&mut self, entries: &[Entry]) -> Result<(), Self::Error> {
            if self.fail_writes {
                return Err("store unavailable".to_string());
            }
            for entry in entries {
                self.entries.insert((entry.user_id, entry.key.clone()), entry.value.clone());
            }
            Ok(())
        }
    }

    struct CountingStore<'a>(&'a std::cell::Cell<usize>);

    impl EntryStore for CountingStore<'_> {
        type Error = String;

        fn get(&self, _user_id: i64, _key: &str) -> Result<Option<Entry>, Self::Error> {
            self.0.set(self.0.get() + 1);
            Ok(None)
        }

        fn upsert_all(&mut self, _entries: &[Entry]) -> Result<(), Self::Error> {
            Err("read-only".to_string())
        }
    }

    fn validator() -> Validator {
        Validator::new(&PatternConfig::default()).unwrap_or_else(|err| panic!("{err}"))
    }

    fn export_text(store: &MemoryStore, user_ids: &str, attributes: &str) -> String {
        let export = export_entries(&validator(), store, user_ids, attributes)
            .unwrap_or_else(|err| panic!("export failed: {err}"));
        String::from_utf8(export.bytes).unwrap_or_else(|err| panic!("export is not UTF-8: {err}"))
    }

    // Test IDs: TVAL-001
    #[test]
    fn user_ids_grammar_rejects_empty_and_stray_commas() {
        let validator = validator();
        assert!(validator.matches("1", Grammar::UserIds));
        assert!(validator.matches("1,2,3", Grammar::UserIds));
        for input in ["", ",1,2,3", "1,2,3,", "1,3,,2", "asd,1,2,3", "1,asdf,2"] {
            assert!(!validator.matches(input, Grammar::UserIds), "accepted {input:?}");
        }
    }

    // Test IDs: TVAL-002
    #[test]
    fn user_ids_grammar_rejects_whitespace() {
        let validator = validator();
        for input in [" 1", "1 ", "1, 2, 3, 4", " 1, 2, 3", "1, 2, 3 ", " ", "1\n"] {
            assert!(!validator.matches(input, Grammar::UserIds), "accepted {input:?}");
        }
    }

    // Test IDs: TVAL-003
    #[test]
    fn attributes_grammar_accepts_word_lists_only() {
        let validator = validator();
        assert!(validator.matches("name,email,name,colors", Grammar::Attributes));
        assert!(validator.matches("name,age", Grammar::Attributes));
        for input in
            ["", ",name,email", "age,email,", "age,name,,email", " name", "name ", "name, age", " "]
        {
            assert!(!validator.matches(input, Grammar::Attributes), "accepted {input:?}");
        }
    }

    // Test IDs: TVAL-004
    #[test]
    fn csv_row_grammar_requires_three_bare_fields() {
        let validator = validator();
        assert!(validator.matches("1,age,31", Grammar::CsvRow));
        assert!(validator.matches("1,name,Ivan", Grammar::CsvRow));
        for input in [
            "1, name,Ivan",
            "1, age,31",
            "1,,name,Ivan",
            "1,name,Ivan ",
            "1,name,Ivan,",
            "1,name, Ivan",
            "1,name, name,Ivan",
            "name,Ivan",
            " ",
        ] {
            assert!(!validator.matches(input, Grammar::CsvRow), "accepted {input:?}");
        }
    }

    // Test IDs: TVAL-010
    #[test]
    fn check_row_requires_exactly_three_matching_fields() {
        let validator = validator();
        assert!(validator.check_row(&["1", "age", "31"]));
        assert!(!validator.check_row(&["1", "age"]));
        assert!(!validator.check_row(&["1", "motto", "carpe,diem"]));
        assert!(!validator.check_row(&["1", " age", "31"]));
    }

    // Test IDs: TVAL-005
    #[test]
    fn unanchored_patterns_still_require_a_full_match() -> Result<(), AttrError> {
        let validator = Validator::new(&PatternConfig {
            user_ids: r"\d+".to_string(),
            attributes: r"\w+".to_string(),
            csv_row: r"\d+,\w+,\w+".to_string(),
        })?;
        assert!(validator.matches("12", Grammar::UserIds));
        assert!(!validator.matches("12,", Grammar::UserIds));
        assert!(!validator.matches("name age", Grammar::Attributes));
        assert!(!validator.matches("1,age,31,", Grammar::CsvRow));
        Ok(())
    }

    // Test IDs: TVAL-006
    #[test]
    fn invalid_pattern_is_reported_at_construction() {
        let result = Validator::new(&PatternConfig {
            attributes: r"^(\w+$".to_string(),
            ..PatternConfig::default()
        });
        match result {
            Err(AttrError::Config(message)) => assert!(message.contains("attributes")),
            other => panic!("expected config error, got {other:?}"),
        }
    }

    // Test IDs: TVAL-007
    #[test]
    fn allowed_file_checks_last_extension_only() {
        let policy = UploadPolicy::default();
        assert!(policy.allowed_file("data.csv"));
        assert!(!policy.allowed_file("data"));
        assert!(!policy.allowed_file("data.png"));
        assert!(!policy.allowed_file("data.tar"));
        assert!(!policy.allowed_file("data.png.zip.tar"));
        assert!(!policy.allowed_file("data.CSV"));

        assert_eq!(
            policy.check_upload(None),
            Err(AttrError::UploadRejected(NO_FILE_UPLOADED.to_string()))
        );
        assert!(policy.check_upload(Some("")).is_err());
        assert!(policy.check_upload(Some("entries.csv")).is_ok());
    }

    // Test IDs: TPAIR-001
    #[test]
    fn expand_pairs_is_row_major() -> Result<(), AttrError> {
        let pairs = expand_pairs("1,2", "name,age")?;
        assert_eq!(
            pairs,
            vec![
                LookupKey::new(1, "name"),
                LookupKey::new(1, "age"),
                LookupKey::new(2, "name"),
                LookupKey::new(2, "age"),
            ]
        );
        Ok(())
    }

    // Test IDs: TPAIR-002
    #[test]
    fn expand_pairs_keeps_duplicates() -> Result<(), AttrError> {
        let pairs = expand_pairs("3,3", "name")?;
        assert_eq!(pairs, vec![LookupKey::new(3, "name"), LookupKey::new(3, "name")]);
        Ok(())
    }

    // Test IDs: TPAIR-003
    #[test]
    fn expand_pairs_rejects_ids_beyond_i64() {
        let result = expand_pairs("1,99999999999999999999", "name");
        assert_eq!(result, Err(AttrError::InvalidRequest(EXPORT_PARAMS_REJECTED.to_string())));

        let lookups = std::cell::Cell::new(0);
        let store = CountingStore(&lookups);
        match export_entries(&validator(), &store, "99999999999999999999", "name") {
            Err(PipelineError::Rejected(err)) => {
                assert_eq!(err.to_string(), EXPORT_PARAMS_REJECTED);
                assert_eq!(err.status_code(), 400);
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        assert_eq!(lookups.get(), 0);
    }

    // Test IDs: TEXP-001
    #[test]
    fn export_fills_missing_pairs_with_empty_values() {
        let mut store = MemoryStore::default();
        store.entries.insert((1, "name".to_string()), "Bob".to_string());

        let text = export_text(&store, "1,12", "name,age");
        assert_eq!(text, "1,name,Bob\n1,age,\n12,name,\n12,age,\n");
        assert_eq!(store.entries.len(), 1);
    }

    // Test IDs: TEXP-002
    #[test]
    fn export_rejects_bad_params_without_touching_store() {
        let lookups = std::cell::Cell::new(0);
        let store = CountingStore(&lookups);

        let result = export_entries(&validator(), &store, "1, 2", "name");
        match result {
            Err(PipelineError::Rejected(err)) => {
                assert_eq!(err.to_string(), EXPORT_PARAMS_REJECTED);
                assert_eq!(err.status_code(), 400);
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        assert_eq!(lookups.get(), 0);

        assert!(export_entries(&validator(), &store, "1", "").is_err());
        assert_eq!(lookups.get(), 0);
    }

    // Test IDs: TEXP-003
    #[test]
    fn export_reports_row_count_and_filename() -> Result<(), PipelineError<String>> {
        let lookups = std::cell::Cell::new(0);
        let store = CountingStore(&lookups);
        let export = export_entries(&validator(), &store, "1,2,3", "name,age")?;
        assert_eq!(export.filename, "data.csv");
        assert_eq!(export.rows, 6);
        assert_eq!(lookups.get(), 6);
        Ok(())
    }

    // Test IDs: TEXP-004
    #[test]
    fn encode_entries_quotes_values_with_commas() -> Result<(), AttrError> {
        let bytes = encode_entries(&[Entry::new(4, "motto", "carpe, diem")])?;
        assert_eq!(bytes, b"4,motto,\"carpe, diem\"\n".to_vec());
        Ok(())
    }

    // Test IDs: TIMP-001
    #[test]
    fn import_then_export_round_trip() -> Result<(), PipelineError<String>> {
        let mut store = MemoryStore::default();
        assert_eq!(export_text(&store, "1", "name"), "1,name,\n");

        let summary = import_entries(&validator(), &mut store, "1,name,Bob\n".as_bytes())?;
        assert_eq!(summary.rows, 1);
        assert_eq!(export_text(&store, "1", "name"), "1,name,Bob\n");
        Ok(())
    }

    // Test IDs: TIMP-002
    #[test]
    fn import_is_idempotent() -> Result<(), PipelineError<String>> {
        let csv = "1,name,Bob\n2,age,31\n1,name,Alice\n";
        let mut once = MemoryStore::default();
        import_entries(&validator(), &mut once, csv.as_bytes())?;

        let mut twice = MemoryStore::default();
        import_entries(&validator(), &mut twice, csv.as_bytes())?;
        import_entries(&validator(), &mut twice, csv.as_bytes())?;

        assert_eq!(once.entries, twice.entries);
        assert_eq!(twice.value(1, "name"), Some("Alice"));
        Ok(())
    }

    // Test IDs: TIMP-003
    #[test]
    fn import_aborts_on_first_bad_row_without_writing() {
        let mut store = MemoryStore::default();
        store.entries.insert((1, "name".to_string()), "Bob".to_string());

        let result =
            import_entries(&validator(), &mut store, "1,name,Alice\n2, age,31\n3,x,y\n".as_bytes());
        match result {
            Err(PipelineError::Rejected(err)) => {
                assert_eq!(err, AttrError::MalformedRow { line: 1 });
                assert_eq!(err.to_string(), "CSV file is broken on line 1");
                assert_eq!(err.payload(), Some(serde_json::json!({ "line": 1 })));
            }
            other => panic!("expected malformed row, got {other:?}"),
        }
        assert_eq!(store.value(1, "name"), Some("Bob"));
        assert_eq!(store.entries.len(), 1);
    }

    // Test IDs: TIMP-004
    #[test]
    fn empty_import_is_a_no_op() -> Result<(), PipelineError<String>> {
        let mut store = MemoryStore { fail_writes: true, ..MemoryStore::default() };
        let summary = import_entries(&validator(), &mut store, "".as_bytes())?;
        assert_eq!(summary.rows, 0);
        assert!(store.entries.is_empty());
        Ok(())
    }

    // Test IDs: TIMP-005
    #[test]
    fn header_like_row_is_imported_as_data() -> Result<(), PipelineError<String>> {
        let mut store = MemoryStore::default();
        import_entries(&validator(), &mut store, "0,key,value\n".as_bytes())?;
        assert_eq!(store.value(0, "key"), Some("value"));

        let result = import_entries(&validator(), &mut store, "user_id,key,value\n".as_bytes());
        assert!(matches!(
            result,
            Err(PipelineError::Rejected(AttrError::MalformedRow { line: 0 }))
        ));
        Ok(())
    }

    // Test IDs: TIMP-006
    #[test]
    fn quoted_field_with_comma_is_rejected() {
        let rows = parse_rows(&validator(), "1,motto,\"carpe,diem\"\n".as_bytes());
        assert_eq!(rows, Err(AttrError::MalformedRow { line: 0 }));
    }

    // Test IDs: TIMP-007
    #[test]
    fn overlong_key_is_a_malformed_row() {
        let csv = format!("1,name,Bob\n2,{},x\n", "k".repeat(MAX_KEY_LEN + 1));
        let rows = parse_rows(&validator(), csv.as_bytes());
        assert_eq!(rows, Err(AttrError::MalformedRow { line: 1 }));
    }

    // Test IDs: TIMP-008
    #[test]
    fn store_failure_is_not_a_rejection() {
        let mut store = MemoryStore { fail_writes: true, ..MemoryStore::default() };
        let result = import_entries(&validator(), &mut store, "1,name,Bob\n".as_bytes());
        assert!(matches!(result, Err(PipelineError::Store(message)) if message == "store unavailable"));
    }

    // Test IDs: TIMP-009
    #[test]
    fn invalid_utf8_row_is_malformed() {
        let bytes = b"1,name,Bob\n2,age,\xff\xfe\n".to_vec();
        let rows = parse_rows(&validator(), bytes.as_slice());
        assert_eq!(rows, Err(AttrError::MalformedRow { line: 1 }));
    }

    // Test IDs: TIMP-010
    #[test]
    fn blank_line_is_a_malformed_row_at_its_own_index() {
        let rows = parse_rows(&validator(), "1,a,b\n\n2,c,d\n".as_bytes());
        assert_eq!(rows, Err(AttrError::MalformedRow { line: 1 }));

        let rows = parse_rows(&validator(), "1,a,b\n2,c,d\n\n3, x,y\n".as_bytes());
        assert_eq!(rows, Err(AttrError::MalformedRow { line: 2 }));

        let rows = parse_rows(&validator(), "1,a,b\n2,c,d\n3, x,y\n".as_bytes());
        assert_eq!(rows, Err(AttrError::MalformedRow { line: 2 }));
    }

    // Test IDs: TIMP-011
    #[test]
    fn crlf_lines_and_quoted_fields_are_accepted() -> Result<(), AttrError> {
        let rows = parse_rows(&validator(), "1,a,b\r\n2,name,\"Bob\"\r\n".as_bytes())?;
        assert_eq!(rows, vec![Entry::new(1, "a", "b"), Entry::new(2, "name", "Bob")]);

        let rows = parse_rows(&validator(), "1,a,b\r2,c,d\n".as_bytes());
        assert_eq!(rows, Err(AttrError::MalformedRow { line: 0 }));
        Ok(())
    }

    // Test IDs: TVAL-008
    #[test]
    fn placeholder_has_empty_value_and_readable_display() {
        let pair = LookupKey::new(7, "email");
        let placeholder = Entry::placeholder(&pair);
        assert_eq!(placeholder, Entry::new(7, "email", ""));
        assert!(placeholder.validate().is_ok());
        assert_eq!(pair.to_string(), "(7, email)");
        assert_eq!(
            Entry::new(1, "name", "Bob").to_string(),
            "<Entry user_id: 1, key: name, value: Bob>"
        );
    }

    // Test IDs: TVAL-009
    #[test]
    fn entry_validate_rejects_negative_ids_and_empty_keys() {
        assert!(Entry::new(-1, "name", "x").validate().is_err());
        assert!(Entry::new(1, "", "x").validate().is_err());
        assert!(Entry::new(1, "name", "").validate().is_ok());
    }

    // Test IDs: TPROP-001
    proptest! {
        #[test]
        fn property_user_ids_with_a_space_never_match(digits in "[0-9]{1,12}", at in 0usize..13) {
            let at = at.min(digits.len());
            let input = format!("{} {}", &digits[..at], &digits[at..]);
            prop_assert!(!validator().matches(&input, Grammar::UserIds));
        }
    }

    // Test IDs: TPROP-002
    proptest! {
        #[test]
        fn property_expansion_is_cross_product_in_order(
            ids in proptest::collection::vec(0i64..10_000, 1..6),
            attrs in proptest::collection::vec("[a-z_]{1,8}", 1..6),
        ) {
            let ids_param = ids.iter().map(ToString::to_string).collect::<Vec<_>>().join(",");
            let attrs_param = attrs.join(",");
            prop_assert!(validator().check_export_params(&ids_param, &attrs_param).is_ok());

            let pairs = expand_pairs(&ids_param, &attrs_param)
                .unwrap_or_else(|err| panic!("expansion failed: {err}"));
            prop_assert_eq!(pairs.len(), ids.len() * attrs.len());
            for (index, pair) in pairs.iter().enumerate() {
                prop_assert_eq!(pair.user_id, ids[index / attrs.len()]);
                prop_assert_eq!(&pair.attribute, &attrs[index % attrs.len()]);
            }
        }
    }
}
