//! Rewrite rules retarget backup keys from source table ids to the ids the
//! target cluster allocated.
//!
//! Rules are pure prefix substitutions over decoded keys: one rule for a
//! table's row data and one per index. Old and new prefixes always have
//! equal length, so rewriting preserves the order of the suffixes and a
//! file's sortedness survives the rewrite.

use crate::codec;
use crate::errors::{Error, Result};
use crate::manifest::{BackupFile, TableMeta};

/// One prefix substitution.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RewriteRule {
    pub old_key_prefix: Vec<u8>,
    pub new_key_prefix: Vec<u8>,
    /// Restore timestamp stamped onto rewritten versions.
    pub new_timestamp: u64,
}

/// The two disjoint rule sets of a restore: row-data prefixes and index
/// prefixes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RewriteRules {
    pub data: Vec<RewriteRule>,
    pub index: Vec<RewriteRule>,
}

impl RewriteRules {
    pub fn is_empty(&self) -> bool {
        self.data.is_empty() && self.index.is_empty()
    }

    /// Fold another table's rules into this set.
    pub fn extend(&mut self, other: RewriteRules) {
        self.data.extend(other.data);
        self.index.extend(other.index);
    }

    /// The rule whose old prefix covers `key`, searching data rules first.
    pub fn find(&self, key: &[u8]) -> Option<&RewriteRule> {
        self.data
            .iter()
            .chain(self.index.iter())
            .find(|rule| key.starts_with(&rule.old_key_prefix))
    }

    /// Rewrite one key, or None when no rule covers it.
    pub fn rewrite_key(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.find(key).map(|rule| {
            let mut out = Vec::with_capacity(key.len());
            out.extend_from_slice(&rule.new_key_prefix);
            out.extend_from_slice(&key[rule.old_key_prefix.len()..]);
            out
        })
    }
}

/// Build the rules mapping `old` table's keys onto `new` table's keys.
///
/// Indexes are matched by name: the target cluster may have allocated
/// different index ids during re-creation.
pub fn table_rewrite_rules(old: &TableMeta, new: &TableMeta, new_ts: u64) -> RewriteRules {
    let mut rules = RewriteRules {
        data: vec![RewriteRule {
            old_key_prefix: codec::table_row_prefix(old.id),
            new_key_prefix: codec::table_row_prefix(new.id),
            new_timestamp: new_ts,
        }],
        index: Vec::new(),
    };
    for old_index in &old.indexes {
        let Some(new_index) = new.indexes.iter().find(|i| i.name == old_index.name) else {
            tracing::warn!(
                table = %old.name,
                index = %old_index.name,
                "index missing on recreated table, skipping rewrite rule"
            );
            continue;
        };
        rules.index.push(RewriteRule {
            old_key_prefix: codec::table_index_prefix(old.id, old_index.id),
            new_key_prefix: codec::table_index_prefix(new.id, new_index.id),
            new_timestamp: new_ts,
        });
    }
    rules
}

/// Relabel a backup file's key range with the target table's prefixes so the
/// range can be matched against regions. Fails when either bound escapes the
/// rule set; partial coverage would import keys into the wrong table.
pub fn rewrite_file_range(file: &BackupFile, rules: &RewriteRules) -> Result<(Vec<u8>, Vec<u8>)> {
    let rule_miss = |key: &[u8]| Error::RewriteRuleNotFound {
        table_id: codec::decode_table_id(key).unwrap_or(0),
        key_len: key.len(),
    };
    let start = rules
        .rewrite_key(&file.start_key)
        .ok_or_else(|| rule_miss(&file.start_key))?;
    let end = if file.end_key.is_empty() {
        // Open-ended file: close it at the rewritten table's upper bound.
        let rule = rules
            .find(&file.start_key)
            .ok_or_else(|| rule_miss(&file.start_key))?;
        let table_id = codec::decode_table_id(&rule.new_key_prefix)?;
        codec::table_prefix(table_id + 1)
    } else {
        rules
            .rewrite_key(&file.end_key)
            .ok_or_else(|| rule_miss(&file.end_key))?
    };
    Ok((start, end))
}
