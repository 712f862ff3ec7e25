//! Per-image annotation history
//!
//! The log is a `Vec` of entries plus a cursor. Entries `1..=cursor` are
//! applied; everything past the cursor is the redo branch, discarded by the
//! next `apply`. The live annotation set is maintained incrementally and
//! always equals a replay of the applied entries.

use chrono::{DateTime, Utc};
use samstudio_core::{AnnotationId, AnnotationObject, Error, Geometry, Provenance, Result};
use samstudio_engine::MaskResult;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, error};

/// A change to one annotation's content.
#[derive(Debug, Clone, PartialEq)]
pub enum EditKind {
    /// Replace the geometry
    Geometry(Geometry),
    /// Change the class label
    Label(String),
    /// Move the geometry by an offset
    Translate { dx: f32, dy: f32 },
}

/// A mutation requested by the user.
#[derive(Debug, Clone)]
pub enum Operation {
    Create {
        label: String,
        geometry: Geometry,
        provenance: Provenance,
        model_version: Option<String>,
        score: Option<f32>,
    },
    /// Commit a model candidate as a new annotation
    AcceptMask { candidate: MaskResult, label: String },
    Edit { id: AnnotationId, change: EditKind },
    Delete { id: AnnotationId },
    /// Bring back a deleted annotation in its last state
    Restore { id: AnnotationId },
}

impl Operation {
    /// Manually drawn annotation
    pub fn manual(label: impl Into<String>, geometry: Geometry) -> Self {
        Operation::Create {
            label: label.into(),
            geometry,
            provenance: Provenance::Manual,
            model_version: None,
            score: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Create,
    Edit,
    Delete,
    Restore,
}

/// One applied operation with the annotation's state on either side of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub seq: u64,
    pub kind: EntryKind,
    pub annotation_id: AnnotationId,
    pub before: Option<AnnotationObject>,
    pub after: Option<AnnotationObject>,
    pub applied_at: DateTime<Utc>,
}

/// Result of an undo or redo step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryOutcome {
    Applied { seq: u64, annotation_id: AnnotationId },
    /// Nothing to undo or redo
    AtBoundary,
}

#[derive(Debug, Default)]
pub struct AnnotationHistory {
    entries: Vec<HistoryEntry>,
    cursor: usize,
    live: BTreeMap<AnnotationId, AnnotationObject>,
    /// Last state of deleted annotations, for `Restore`
    tombstones: BTreeMap<AnnotationId, AnnotationObject>,
    issued: HashSet<AnnotationId>,
    next_id: u64,
}

impl AnnotationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply an operation, discarding any redo branch.
    ///
    /// Returns the annotation as it stands after the operation; for a delete,
    /// the state it had when deleted.
    pub fn apply(&mut self, operation: Operation) -> Result<AnnotationObject> {
        let (kind, id, before, after) = self.plan(operation)?;

        if self.cursor < self.entries.len() {
            debug!(
                "Discarding {} redo entries after seq {}",
                self.entries.len() - self.cursor,
                self.cursor
            );
            self.entries.truncate(self.cursor);
        }

        let seq = self.cursor as u64 + 1;
        if let Some(last) = self.entries.last() {
            if last.seq + 1 != seq {
                error!("History sequence gap: last {} next {}", last.seq, seq);
                return Err(Error::InvariantViolation(format!(
                    "history sequence gap after {}",
                    last.seq
                )));
            }
        }

        let entry = HistoryEntry {
            seq,
            kind,
            annotation_id: id,
            before,
            after,
            applied_at: Utc::now(),
        };
        self.install(&entry, true);
        self.entries.push(entry);
        self.cursor = self.entries.len();

        let entry = &self.entries[self.cursor - 1];
        entry
            .after
            .clone()
            .or_else(|| entry.before.clone())
            .ok_or_else(|| Error::InvariantViolation(format!("entry {} carries no state", seq)))
    }

    /// Step the cursor back over the last applied entry and revert it.
    pub fn undo(&mut self) -> HistoryOutcome {
        if self.cursor == 0 {
            return HistoryOutcome::AtBoundary;
        }
        let entry = self.entries[self.cursor - 1].clone();
        self.install(&entry, false);
        self.cursor -= 1;
        HistoryOutcome::Applied {
            seq: entry.seq,
            annotation_id: entry.annotation_id,
        }
    }

    /// Re-apply the entry just past the cursor.
    pub fn redo(&mut self) -> HistoryOutcome {
        if self.cursor == self.entries.len() {
            return HistoryOutcome::AtBoundary;
        }
        let entry = self.entries[self.cursor].clone();
        self.install(&entry, true);
        self.cursor += 1;
        HistoryOutcome::Applied {
            seq: entry.seq,
            annotation_id: entry.annotation_id,
        }
    }

    fn plan(
        &mut self,
        operation: Operation,
    ) -> Result<(EntryKind, AnnotationId, Option<AnnotationObject>, Option<AnnotationObject>)> {
        match operation {
            Operation::Create {
                label,
                geometry,
                provenance,
                model_version,
                score,
            } => {
                let object = self.new_object(label, geometry, provenance, model_version, score);
                Ok((EntryKind::Create, object.id, None, Some(object)))
            }
            Operation::AcceptMask { candidate, label } => {
                let object = self.new_object(
                    label,
                    Geometry::mask(candidate.mask),
                    Provenance::ModelAccepted,
                    Some(candidate.model_version),
                    Some(candidate.score),
                );
                Ok((EntryKind::Create, object.id, None, Some(object)))
            }
            Operation::Edit { id, change } => {
                let before = self.live.get(&id).cloned().ok_or(Error::UnknownAnnotation(id))?;
                let mut after = before.clone();
                match change {
                    EditKind::Geometry(geometry) => {
                        after.geometry = geometry;
                        after.provenance = after.provenance.after_geometry_edit();
                    }
                    EditKind::Label(label) => after.label = label,
                    EditKind::Translate { dx, dy } => {
                        after.geometry = after.geometry.translated(dx, dy);
                        after.provenance = after.provenance.after_geometry_edit();
                    }
                }
                after.version += 1;
                Ok((EntryKind::Edit, id, Some(before), Some(after)))
            }
            Operation::Delete { id } => {
                let before = self.live.get(&id).cloned().ok_or(Error::UnknownAnnotation(id))?;
                Ok((EntryKind::Delete, id, Some(before), None))
            }
            Operation::Restore { id } => {
                let restored = self.tombstones.get(&id).cloned().ok_or(Error::UnknownAnnotation(id))?;
                Ok((EntryKind::Restore, id, None, Some(restored)))
            }
        }
    }

    fn new_object(
        &mut self,
        label: String,
        geometry: Geometry,
        provenance: Provenance,
        model_version: Option<String>,
        score: Option<f32>,
    ) -> AnnotationObject {
        // Ids are never reused, even when a creation is undone
        self.next_id += 1;
        let id = AnnotationId(self.next_id);
        self.issued.insert(id);
        AnnotationObject {
            id,
            label,
            geometry,
            provenance,
            version: 0,
            model_version,
            score,
            created_at: Utc::now(),
        }
    }

    /// Move the live set across `entry`, forwards or backwards.
    fn install(&mut self, entry: &HistoryEntry, forward: bool) {
        let (from, to) = if forward {
            (&entry.before, &entry.after)
        } else {
            (&entry.after, &entry.before)
        };
        let id = entry.annotation_id;

        match to {
            Some(object) => {
                self.tombstones.remove(&id);
                self.live.insert(id, object.clone());
            }
            None => {
                self.live.remove(&id);
                match (entry.kind, from) {
                    // Undoing a creation leaves nothing to restore
                    (EntryKind::Create, _) | (_, None) => {
                        self.tombstones.remove(&id);
                    }
                    (_, Some(last)) => {
                        self.tombstones.insert(id, last.clone());
                    }
                }
            }
        }
    }

    /// Live annotations in creation order
    pub fn annotations(&self) -> impl Iterator<Item = &AnnotationObject> {
        self.live.values()
    }

    pub fn get(&self, id: AnnotationId) -> Option<&AnnotationObject> {
        self.live.get(&id)
    }

    pub fn is_live(&self, id: AnnotationId) -> bool {
        self.live.contains_key(&id)
    }

    pub fn is_deleted(&self, id: AnnotationId) -> bool {
        self.tombstones.contains_key(&id)
    }

    /// Whether the id was ever handed out in this history
    pub fn ever_existed(&self, id: AnnotationId) -> bool {
        self.issued.contains(&id)
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    /// Number of applied entries
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn can_undo(&self) -> bool {
        self.cursor > 0
    }

    pub fn can_redo(&self) -> bool {
        self.cursor < self.entries.len()
    }

    /// Rebuild the live set from scratch by replaying `1..=cursor`.
    pub fn replay(&self) -> Vec<AnnotationObject> {
        let mut live: BTreeMap<AnnotationId, AnnotationObject> = BTreeMap::new();
        for entry in &self.entries[..self.cursor] {
            match &entry.after {
                Some(object) => {
                    live.insert(entry.annotation_id, object.clone());
                }
                None => {
                    live.remove(&entry.annotation_id);
                }
            }
        }
        live.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use samstudio_core::{Point, Rect};

    fn square(size: f32) -> Geometry {
        Geometry::polygon(vec![
            Point::new(0.0, 0.0),
            Point::new(size, 0.0),
            Point::new(size, size),
            Point::new(0.0, size),
        ])
    }

    fn live(history: &AnnotationHistory) -> Vec<AnnotationObject> {
        history.annotations().cloned().collect()
    }

    #[test]
    fn test_create_assigns_sequence_and_version() {
        let mut history = AnnotationHistory::new();
        let a = history.apply(Operation::manual("car", square(4.0))).unwrap();
        let b = history.apply(Operation::manual("tree", square(2.0))).unwrap();

        assert_eq!(a.id, AnnotationId(1));
        assert_eq!(b.id, AnnotationId(2));
        assert_eq!(a.version, 0);
        let seqs: Vec<u64> = history.entries().iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2]);
        assert_eq!(history.cursor(), 2);
    }

    #[test]
    fn test_edit_increments_version_and_undo_restores() {
        let mut history = AnnotationHistory::new();
        let a = history.apply(Operation::manual("car", square(4.0))).unwrap();

        let edited = history
            .apply(Operation::Edit {
                id: a.id,
                change: EditKind::Geometry(square(8.0)),
            })
            .unwrap();
        assert_eq!(edited.version, 1);

        assert_eq!(
            history.undo(),
            HistoryOutcome::Applied {
                seq: 2,
                annotation_id: a.id
            }
        );
        let current = history.get(a.id).unwrap();
        assert_eq!(current.version, 0);
        assert_eq!(current.geometry, square(4.0));

        history.redo();
        assert_eq!(history.get(a.id).unwrap().version, 1);
    }

    #[test]
    fn test_label_and_translate_edits() {
        let mut history = AnnotationHistory::new();
        let a = history
            .apply(Operation::Create {
                label: "car".to_string(),
                geometry: square(4.0),
                provenance: Provenance::ModelAccepted,
                model_version: Some("v1".to_string()),
                score: Some(0.9),
            })
            .unwrap();

        let relabeled = history
            .apply(Operation::Edit {
                id: a.id,
                change: EditKind::Label("truck".to_string()),
            })
            .unwrap();
        assert_eq!(relabeled.label, "truck");
        assert_eq!(relabeled.provenance, Provenance::ModelAccepted);

        let moved = history
            .apply(Operation::Edit {
                id: a.id,
                change: EditKind::Translate { dx: 10.0, dy: 5.0 },
            })
            .unwrap();
        assert_eq!(moved.version, 2);
        assert_eq!(moved.provenance, Provenance::ModelEdited);
        assert_eq!(moved.geometry.bounding_box(), Some(Rect::new(10.0, 5.0, 4.0, 4.0)));
    }

    #[test]
    fn test_undo_redo_boundaries() {
        let mut history = AnnotationHistory::new();
        assert_eq!(history.undo(), HistoryOutcome::AtBoundary);
        assert_eq!(history.redo(), HistoryOutcome::AtBoundary);

        history.apply(Operation::manual("car", square(1.0))).unwrap();
        assert_eq!(history.redo(), HistoryOutcome::AtBoundary);
        history.undo();
        assert_eq!(history.undo(), HistoryOutcome::AtBoundary);
        assert!(live(&history).is_empty());
    }

    #[test]
    fn test_apply_after_undo_truncates_redo_branch() {
        let mut history = AnnotationHistory::new();
        history.apply(Operation::manual("a", square(1.0))).unwrap();
        history.apply(Operation::manual("b", square(2.0))).unwrap();
        history.undo();

        let c = history.apply(Operation::manual("c", square(3.0))).unwrap();
        assert_eq!(history.redo(), HistoryOutcome::AtBoundary);
        assert_eq!(history.len(), 2);
        assert_eq!(history.entries()[1].seq, 2);
        // The undone creation's id is not reused
        assert_eq!(c.id, AnnotationId(3));
        assert!(history.ever_existed(AnnotationId(2)));
    }

    #[test]
    fn test_delete_and_restore() {
        let mut history = AnnotationHistory::new();
        let a = history.apply(Operation::manual("car", square(4.0))).unwrap();
        history
            .apply(Operation::Edit {
                id: a.id,
                change: EditKind::Label("truck".to_string()),
            })
            .unwrap();

        let deleted = history.apply(Operation::Delete { id: a.id }).unwrap();
        assert_eq!(deleted.label, "truck");
        assert!(!history.is_live(a.id));
        assert!(history.is_deleted(a.id));

        let restored = history.apply(Operation::Restore { id: a.id }).unwrap();
        assert_eq!(restored.label, "truck");
        assert_eq!(restored.version, 1);
        assert!(history.is_live(a.id));

        history.undo();
        assert!(history.is_deleted(a.id));
        history.undo();
        assert!(history.is_live(a.id));
        assert!(!history.is_deleted(a.id));
    }

    #[test]
    fn test_unknown_targets_rejected() {
        let mut history = AnnotationHistory::new();
        let err = history
            .apply(Operation::Edit {
                id: AnnotationId(9),
                change: EditKind::Label("x".to_string()),
            })
            .unwrap_err();
        assert!(matches!(err, Error::UnknownAnnotation(AnnotationId(9))));
        assert!(matches!(
            history.apply(Operation::Delete { id: AnnotationId(9) }),
            Err(Error::UnknownAnnotation(_))
        ));

        let a = history.apply(Operation::manual("a", square(1.0))).unwrap();
        // Live annotations cannot be restored
        assert!(matches!(
            history.apply(Operation::Restore { id: a.id }),
            Err(Error::UnknownAnnotation(_))
        ));
        assert!(history.entries().len() == 1);
    }

    #[test]
    fn test_undone_creation_is_not_restorable() {
        let mut history = AnnotationHistory::new();
        let a = history.apply(Operation::manual("a", square(1.0))).unwrap();
        history.undo();
        assert!(!history.is_deleted(a.id));
        assert!(history.apply(Operation::Restore { id: a.id }).is_err());
    }

    #[test]
    fn test_live_set_matches_replay() {
        let mut history = AnnotationHistory::new();
        let a = history.apply(Operation::manual("a", square(1.0))).unwrap();
        let b = history.apply(Operation::manual("b", square(2.0))).unwrap();
        history
            .apply(Operation::Edit {
                id: a.id,
                change: EditKind::Translate { dx: 1.0, dy: 1.0 },
            })
            .unwrap();
        history.apply(Operation::Delete { id: b.id }).unwrap();

        for _ in 0..4 {
            assert_eq!(live(&history), history.replay());
            history.undo();
        }
        for _ in 0..4 {
            history.redo();
            assert_eq!(live(&history), history.replay());
        }
    }

    #[test]
    fn test_entry_serialization() {
        let mut history = AnnotationHistory::new();
        history.apply(Operation::manual("a", square(1.0))).unwrap();
        let json = serde_json::to_value(&history.entries()[0]).unwrap();
        assert_eq!(json["kind"], "create");
        assert_eq!(json["seq"], 1);
        assert!(json["before"].is_null());
    }
}
