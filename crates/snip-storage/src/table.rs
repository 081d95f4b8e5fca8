use crate::MAX_CODE_ATTEMPTS;
use snip_core::{OwnerId, Record, RecordId, Result, ShortCode, StorageError, UserUrl};
use snip_generator::Generator;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// Outcome of offering a URL to a [`RecordTable`].
#[derive(Debug)]
pub(crate) enum Admission {
    /// The URL is already stored under this code.
    Existing(ShortCode),
    /// A record ready to be persisted and pushed.
    New(Record),
}

/// The in-process record list shared by the memory and file backends.
///
/// Records are kept in insertion order and indexed by URL, code and id.
/// Nothing is ever removed.
#[derive(Debug, Default)]
pub(crate) struct RecordTable {
    records: Vec<Record>,
    by_url: HashMap<String, usize>,
    by_code: HashMap<ShortCode, usize>,
    by_id: HashMap<RecordId, usize>,
}

impl RecordTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Builds a table from persisted records.
    ///
    /// The first record wins for any repeated URL or code.
    pub(crate) fn from_records(records: impl IntoIterator<Item = Record>) -> Self {
        let mut table = Self::new();
        for record in records {
            let id = record.id.clone();
            if !table.push(record) {
                warn!(
                    id = %id,
                    "skipping persisted record that repeats an existing url, code or id"
                );
            }
        }
        table
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }

    pub(crate) fn get_by_code(&self, code: &ShortCode) -> Option<&Record> {
        self.by_code.get(code).map(|&index| &self.records[index])
    }

    /// Decides whether `original_url` needs a new record.
    ///
    /// Generated codes that collide with a stored code are retried up to
    /// [`MAX_CODE_ATTEMPTS`] times.
    pub(crate) fn admit<G: Generator>(
        &self,
        owner: &OwnerId,
        original_url: &str,
        generator: &G,
    ) -> Result<Admission> {
        if let Some(&index) = self.by_url.get(original_url) {
            return Ok(Admission::Existing(self.records[index].short_code.clone()));
        }

        for attempt in 1..=MAX_CODE_ATTEMPTS {
            let code: ShortCode = generator.generate().into();
            if self.by_code.contains_key(&code) {
                debug!(code = %code, attempt, "generated short code already taken");
                continue;
            }
            return Ok(Admission::New(Record::new(
                owner.clone(),
                code,
                original_url,
            )));
        }

        Err(StorageError::CodeSpaceExhausted(MAX_CODE_ATTEMPTS))
    }

    /// Appends a record. Returns `false` without storing it if its URL, code or id is taken.
    pub(crate) fn push(&mut self, record: Record) -> bool {
        if self.by_url.contains_key(&record.original_url)
            || self.by_code.contains_key(&record.short_code)
            || self.by_id.contains_key(&record.id)
        {
            return false;
        }

        let index = self.records.len();
        self.by_url.insert(record.original_url.clone(), index);
        self.by_code.insert(record.short_code.clone(), index);
        self.by_id.insert(record.id.clone(), index);
        self.records.push(record);
        true
    }

    /// Translates a code into the id of the record `owner` holds under it.
    pub(crate) fn owned_id(&self, owner: &OwnerId, code: &ShortCode) -> Option<RecordId> {
        self.get_by_code(code)
            .filter(|record| record.is_owned_by(owner))
            .map(|record| record.id.clone())
    }

    /// Flags the given records as deleted and returns how many flipped from live.
    pub(crate) fn mark_deleted(&mut self, ids: &[RecordId]) -> u64 {
        let wanted: HashSet<&RecordId> = ids.iter().collect();
        let mut flipped = 0;

        for id in wanted {
            let Some(&index) = self.by_id.get(id) else {
                continue;
            };
            let record = &mut self.records[index];
            if !record.deleted {
                record.deleted = true;
                flipped += 1;
            }
        }

        flipped
    }

    pub(crate) fn user_urls(&self, owner: &OwnerId, base_url: &str) -> Vec<UserUrl> {
        self.records
            .iter()
            .filter(|record| record.is_owned_by(owner) && !record.deleted)
            .map(|record| UserUrl {
                short_url: record.short_code.to_url(base_url),
                original_url: record.original_url.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snip_generator::SeqGenerator;

    fn owner(id: &str) -> OwnerId {
        OwnerId::new(id)
    }

    fn code(value: &str) -> ShortCode {
        ShortCode::new_unchecked(value)
    }

    fn admit_and_push(
        table: &mut RecordTable,
        owner_id: &str,
        url: &str,
        generator: &SeqGenerator,
    ) -> ShortCode {
        match table.admit(&owner(owner_id), url, generator).unwrap() {
            Admission::Existing(code) => code,
            Admission::New(record) => {
                let code = record.short_code.clone();
                assert!(table.push(record));
                code
            }
        }
    }

    #[test]
    fn admit_returns_existing_code_for_known_url() {
        let generator = SeqGenerator::with_prefix("wh");
        let mut table = RecordTable::new();

        let first = admit_and_push(&mut table, "alice", "http://test.com/", &generator);
        let second = admit_and_push(&mut table, "bob", "http://test.com/", &generator);

        assert_eq!(first, second);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn admit_skips_taken_codes() {
        let mut table = RecordTable::new();
        let first = SeqGenerator::with_prefix("wh");
        admit_and_push(&mut table, "alice", "http://a.com", &first);

        // A fresh generator replays "wh000000" first.
        let replay = SeqGenerator::with_prefix("wh");
        let code = admit_and_push(&mut table, "alice", "http://b.com", &replay);

        assert_eq!(code.as_str(), "wh000001");
    }

    #[test]
    fn admit_gives_up_when_every_code_is_taken() {
        struct Constant;
        impl Generator for Constant {
            type Output = ShortCode;
            fn generate(&self) -> ShortCode {
                ShortCode::new_unchecked("same")
            }
        }

        let mut table = RecordTable::new();
        let admission = table.admit(&owner("alice"), "http://a.com", &Constant);
        let Admission::New(record) = admission.unwrap() else {
            panic!("expected a new record");
        };
        table.push(record);

        let err = table
            .admit(&owner("alice"), "http://b.com", &Constant)
            .unwrap_err();
        assert!(matches!(err, StorageError::CodeSpaceExhausted(_)));
    }

    #[test]
    fn owned_id_requires_matching_owner() {
        let generator = SeqGenerator::with_prefix("wh");
        let mut table = RecordTable::new();
        let stored = admit_and_push(&mut table, "alice", "http://a.com", &generator);

        assert!(table.owned_id(&owner("alice"), &stored).is_some());
        assert!(table.owned_id(&owner("bob"), &stored).is_none());
        assert!(table.owned_id(&OwnerId::anonymous(), &stored).is_none());
        assert!(table.owned_id(&owner("alice"), &code("nope")).is_none());
    }

    #[test]
    fn mark_deleted_counts_only_live_records() {
        let generator = SeqGenerator::with_prefix("wh");
        let mut table = RecordTable::new();
        let code = admit_and_push(&mut table, "alice", "http://a.com", &generator);
        let id = table.owned_id(&owner("alice"), &code).unwrap();

        assert_eq!(table.mark_deleted(&[id.clone(), id.clone()]), 1);
        assert_eq!(table.mark_deleted(&[id]), 0);
        assert!(table.get_by_code(&code).unwrap().deleted);
    }

    #[test]
    fn user_urls_hide_deleted_and_foreign_records() {
        let generator = SeqGenerator::with_prefix("wh");
        let mut table = RecordTable::new();
        let kept = admit_and_push(&mut table, "alice", "http://a.com", &generator);
        let gone = admit_and_push(&mut table, "alice", "http://b.com", &generator);
        admit_and_push(&mut table, "bob", "http://c.com", &generator);

        let id = table.owned_id(&owner("alice"), &gone).unwrap();
        table.mark_deleted(&[id]);

        let urls = table.user_urls(&owner("alice"), "http://localhost:8080/");
        assert_eq!(
            urls,
            vec![UserUrl {
                short_url: format!("http://localhost:8080/{kept}"),
                original_url: "http://a.com".to_string(),
            }]
        );
    }

    #[test]
    fn from_records_keeps_first_duplicate() {
        let first = Record::new(owner("alice"), code("one"), "http://a.com");
        let repeat = Record::new(owner("bob"), code("two"), "http://a.com");

        let table = RecordTable::from_records([first, repeat]);

        assert_eq!(table.len(), 1);
        assert!(table.get_by_code(&code("one")).is_some());
    }
}
