use network_shared::protocol::FrameUpdate;

use super::{DecodeError, DecoderTable, Frame, FrameChanges};

/// Produces a new frame from the previous one and a sparse update.
#[derive(Debug, Clone)]
pub struct FrameAssembler {
    decoders: DecoderTable,
}

impl FrameAssembler {
    pub fn new(decoders: DecoderTable) -> Self {
        Self { decoders }
    }

    pub fn decoders(&self) -> &DecoderTable {
        &self.decoders
    }

    pub fn decoders_mut(&mut self) -> &mut DecoderTable {
        &mut self.decoders
    }

    /// Applies `update` on top of `previous`.
    ///
    /// Untouched fields are shared with `previous`. A reset update starts from
    /// an empty frame and marks everything changed; the change set still names
    /// every field of the discarded frame and of the update. A decode failure
    /// rejects the whole update and leaves `previous` as the current frame.
    pub fn apply(
        &self,
        previous: Option<&Frame>,
        update: &FrameUpdate,
    ) -> Result<(Frame, FrameChanges), DecodeError> {
        let decoded = update
            .values
            .iter()
            .map(|(field, raw)| {
                self.decoders
                    .decode(field, raw)
                    .map(|value| (field.clone(), value))
            })
            .collect::<Result<Vec<_>, DecodeError>>()?;

        let mut changes = FrameChanges::default();
        let mut frame = match previous {
            Some(previous) if update.is_reset() => {
                changes.all = true;
                changes.fields.extend(previous.field_ids().map(str::to_owned));
                Frame::new()
            }
            Some(previous) => previous.clone(),
            None => {
                changes.all = update.is_reset();
                Frame::new()
            }
        };

        for (field, value) in decoded {
            changes.mark(field.clone());
            frame.insert(field, value);
        }
        Ok((frame, changes))
    }
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new(DecoderTable::standard())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{DecodeFault, FieldValue};
    use network_shared::Value;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeSet;

    fn raw(value: i32) -> FieldValue {
        FieldValue::Raw(Value::from(value))
    }

    fn fields(changes: &FrameChanges) -> Vec<&str> {
        changes.fields.iter().map(String::as_str).collect()
    }

    #[test]
    fn first_update_builds_fresh_frame() {
        let assembler = FrameAssembler::default();
        let (frame, changes) = assembler
            .apply(None, &FrameUpdate::new(1).with_value("a", 1))
            .unwrap();
        assert_eq!(frame.get("a"), Some(&raw(1)));
        assert!(!changes.all);
        assert_eq!(fields(&changes), vec!["a"]);
    }

    #[test]
    fn untouched_fields_are_shared() {
        let assembler = FrameAssembler::default();
        let (first, _) = assembler
            .apply(None, &FrameUpdate::new(1).with_value("a", 1).with_value("b", 2))
            .unwrap();
        let (second, changes) = assembler
            .apply(Some(&first), &FrameUpdate::new(2).with_value("b", 3))
            .unwrap();

        assert!(second.shares_field(&first, "a"));
        assert!(!second.shares_field(&first, "b"));
        assert_eq!(first.get("b"), Some(&raw(2)));
        assert_eq!(second.get("b"), Some(&raw(3)));
        assert_eq!(fields(&changes), vec!["b"]);
    }

    #[test]
    fn disjoint_updates_compose() {
        let assembler = FrameAssembler::default();
        let base = Frame::new();
        let u1 = FrameUpdate::new(1).with_value("a", 1);
        let u2 = FrameUpdate::new(2).with_value("b", 2);

        let mut both = u1.clone();
        both.values.extend(u2.values.clone());
        let (batched, _) = assembler.apply(Some(&base), &both).unwrap();

        let (step, _) = assembler.apply(Some(&base), &u1).unwrap();
        let (stepped, _) = assembler.apply(Some(&step), &u2).unwrap();

        assert_eq!(batched, stepped);
    }

    #[test]
    fn reset_clears_history() {
        let assembler = FrameAssembler::default();
        let (before, _) = assembler
            .apply(None, &FrameUpdate::new(1).with_value("a", 1).with_value("b", 2))
            .unwrap();

        let (after, changes) = assembler
            .apply(Some(&before), &FrameUpdate::new(0).with_value("c", 3))
            .unwrap();

        assert_eq!(after.field_ids().collect::<Vec<_>>(), vec!["c"]);
        assert!(changes.all);
        assert_eq!(
            changes.fields,
            BTreeSet::from(["a".to_owned(), "b".to_owned(), "c".to_owned()])
        );
        assert!(changes.has_changed("anything"));
    }

    #[test]
    fn explicit_reset_flag_also_clears() {
        let assembler = FrameAssembler::default();
        let (before, _) = assembler
            .apply(None, &FrameUpdate::new(1).with_value("a", 1))
            .unwrap();
        let (after, changes) = assembler
            .apply(Some(&before), &FrameUpdate::new(9).with_reset())
            .unwrap();
        assert!(after.is_empty());
        assert!(changes.all);
    }

    #[test]
    fn decode_failure_rejects_whole_update() {
        let assembler = FrameAssembler::default();
        let (before, _) = assembler
            .apply(None, &FrameUpdate::new(1).with_value("a", 1))
            .unwrap();

        let bad = FrameUpdate::new(2)
            .with_value("a", 5)
            .with_value("particle.positions", vec![0u8; 13]);
        let err = assembler.apply(Some(&before), &bad).unwrap_err();

        assert_eq!(err.field, "particle.positions");
        assert_eq!(err.fault, DecodeFault::Stride { len: 13, stride: 12 });
        assert_eq!(before.get("a"), Some(&raw(1)));
    }
}
