//! Replicated document capability and its Yrs-backed implementation.
//!
//! The sync layer never looks inside a document. It only needs the full
//! state, a way to merge an update, and a feed of updates as they happen.

use mesh_core::{HandlerId, ObserverRegistry};
use yrs::updates::decoder::Decode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Transaction, TransactionMut, Update};

/// Where an update came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote,
}

/// An update as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentUpdate {
    pub update: Vec<u8>,
    pub origin: Origin,
}

#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("malformed update: {0}")]
    Decode(String),

    #[error("update rejected: {0}")]
    Apply(String),
}

/// A CRDT document. Applying the same updates in any order, any number of
/// times, must converge to the same state.
pub trait ReplicatedDocument: Send + Sync {
    /// The whole state, encoded as one update.
    fn encode_state(&self) -> Vec<u8>;

    fn apply_update(&self, update: &[u8], origin: Origin) -> Result<(), DocumentError>;

    /// Observe every update applied to this document.
    fn subscribe(&self, handler: Box<dyn Fn(&DocumentUpdate) + Send + Sync>) -> HandlerId;

    fn unsubscribe(&self, id: HandlerId) -> bool;
}

/// Encoding of an update that changes nothing.
const EMPTY_UPDATE: [u8; 2] = [0, 0];

/// [`ReplicatedDocument`] over a `yrs::Doc`.
///
/// Local edits go through [`YrsDocument::update_local`], which commits the
/// transaction and hands its delta to subscribers.
pub struct YrsDocument {
    doc: Doc,
    observers: ObserverRegistry<DocumentUpdate>,
}

impl YrsDocument {
    pub fn new() -> Self {
        Self {
            doc: Doc::new(),
            observers: ObserverRegistry::new(),
        }
    }

    /// Read-only view of the current state. Writes go through
    /// [`YrsDocument::update_local`] so that subscribers see them.
    pub fn transact(&self) -> Transaction<'_> {
        self.doc.transact()
    }

    /// Run a local edit and publish its delta.
    pub fn update_local<R>(&self, edit: impl FnOnce(&mut TransactionMut) -> R) -> R {
        let (result, update) = {
            let mut txn = self.doc.transact_mut();
            let result = edit(&mut txn);
            (result, txn.encode_update_v1())
        };
        if update != EMPTY_UPDATE {
            self.observers.notify(&DocumentUpdate {
                update,
                origin: Origin::Local,
            });
        }
        result
    }
}

impl Default for YrsDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicatedDocument for YrsDocument {
    fn encode_state(&self) -> Vec<u8> {
        self.doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }

    fn apply_update(&self, update: &[u8], origin: Origin) -> Result<(), DocumentError> {
        let decoded = Update::decode_v1(update).map_err(|e| DocumentError::Decode(e.to_string()))?;
        {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(decoded)
                .map_err(|e| DocumentError::Apply(e.to_string()))?;
        }
        self.observers.notify(&DocumentUpdate {
            update: update.to_vec(),
            origin,
        });
        Ok(())
    }

    fn subscribe(&self, handler: Box<dyn Fn(&DocumentUpdate) + Send + Sync>) -> HandlerId {
        self.observers.add(handler)
    }

    fn unsubscribe(&self, id: HandlerId) -> bool {
        self.observers.remove(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use yrs::{GetString, Text, WriteTxn};

    fn text_of(doc: &YrsDocument) -> String {
        let txn = doc.transact();
        txn.get_text("body").map(|t| t.get_string(&txn)).unwrap_or_default()
    }

    fn insert(doc: &YrsDocument, index: u32, chunk: &str) {
        doc.update_local(|txn| {
            let text = txn.get_or_insert_text("body");
            text.insert(txn, index, chunk);
        });
    }

    fn recorder(doc: &YrsDocument) -> Arc<Mutex<Vec<DocumentUpdate>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        doc.subscribe(Box::new(move |u| sink.lock().push(u.clone())));
        seen
    }

    #[test]
    fn test_local_edit_publishes_delta() {
        let doc = YrsDocument::new();
        let seen = recorder(&doc);
        insert(&doc, 0, "hello");

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].origin, Origin::Local);

        let replica = YrsDocument::new();
        replica.apply_update(&seen[0].update, Origin::Remote).unwrap();
        assert_eq!(text_of(&replica), "hello");
    }

    #[test]
    fn test_read_only_edit_publishes_nothing() {
        let doc = YrsDocument::new();
        let seen = recorder(&doc);
        doc.update_local(|_| ());
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_remote_apply_tagged_remote() {
        let source = YrsDocument::new();
        insert(&source, 0, "x");
        let replica = YrsDocument::new();
        let seen = recorder(&replica);

        replica.apply_update(&source.encode_state(), Origin::Remote).unwrap();
        assert_eq!(seen.lock()[0].origin, Origin::Remote);
    }

    #[test]
    fn test_malformed_update_rejected() {
        let doc = YrsDocument::new();
        let err = doc.apply_update(&[0xff, 0xff, 0xff], Origin::Remote).unwrap_err();
        assert!(matches!(err, DocumentError::Decode(_) | DocumentError::Apply(_)));
    }

    #[test]
    fn test_unsubscribe() {
        let doc = YrsDocument::new();
        let seen = Arc::new(Mutex::new(0));
        let counter = seen.clone();
        let id = doc.subscribe(Box::new(move |_| *counter.lock() += 1));
        insert(&doc, 0, "a");
        assert!(doc.unsubscribe(id));
        insert(&doc, 1, "b");
        assert_eq!(*seen.lock(), 1);
    }

    #[test]
    fn test_state_converges_in_any_order() {
        let a = YrsDocument::new();
        let b = YrsDocument::new();
        let ua = recorder(&a);
        let ub = recorder(&b);
        insert(&a, 0, "left ");
        insert(&b, 0, "right");

        let updates: Vec<Vec<u8>> = ua.lock().iter().chain(ub.lock().iter()).map(|u| u.update.clone()).collect();

        let forward = YrsDocument::new();
        for u in &updates {
            forward.apply_update(u, Origin::Remote).unwrap();
        }
        let backward = YrsDocument::new();
        for u in updates.iter().rev().chain(updates.iter()) {
            backward.apply_update(u, Origin::Remote).unwrap();
        }
        assert_eq!(text_of(&forward), text_of(&backward));
        assert_eq!(text_of(&forward).len(), "left right".len());
    }

    #[test]
    fn test_reads_see_local_and_remote_edits() {
        let doc = YrsDocument::new();
        let seen = recorder(&doc);
        insert(&doc, 0, "local");

        let other = YrsDocument::new();
        insert(&other, 0, "remote ");
        doc.apply_update(&other.encode_state(), Origin::Remote).unwrap();

        assert_eq!(text_of(&doc).len(), "remote local".len());
        assert_eq!(seen.lock().len(), 2);
        assert_eq!(seen.lock()[0].origin, Origin::Local);
    }
}
