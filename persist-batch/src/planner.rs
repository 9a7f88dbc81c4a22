use std::collections::HashSet;

use report_common::report::ReportRecord;

/// Records written together in one atomic transaction. No two records share a player.
#[derive(Debug, Clone, Default)]
pub struct TransactionGroup {
    records: Vec<ReportRecord>,
    players: HashSet<String>,
}

impl TransactionGroup {
    fn accepts(&self, record: &ReportRecord, max_records: usize) -> bool {
        self.records.len() < max_records && !self.players.contains(&record.player_id)
    }

    fn push(&mut self, record: ReportRecord) {
        self.players.insert(record.player_id.clone());
        self.records.push(record);
    }

    pub fn records(&self) -> &[ReportRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl From<ReportRecord> for TransactionGroup {
    fn from(record: ReportRecord) -> Self {
        let mut group = TransactionGroup::default();
        group.push(record);
        group
    }
}

/// Split records into transaction groups, greedy first-fit.
///
/// Each record goes into the first open group that has room and holds no record for the same
/// player, or else starts a new group. Input order is kept within each group.
pub fn plan_groups(records: Vec<ReportRecord>, max_records: usize) -> Vec<TransactionGroup> {
    let max_records = max_records.max(1);
    let mut groups: Vec<TransactionGroup> = Vec::new();

    for record in records {
        match groups
            .iter_mut()
            .find(|group| group.accepts(&record, max_records))
        {
            Some(group) => group.push(record),
            None => groups.push(TransactionGroup::from(record)),
        }
    }

    groups
}
