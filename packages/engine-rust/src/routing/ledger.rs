/// Undo log for operator state touched while a send is still undecided.
///
/// Stateful operators record how to reverse each change they make during
/// evaluation (a dedup key remembered, a join partner parked or claimed).
/// The send path rolls the ledger back when the send or batch fails and
/// simply drops it once the messages are delivered.
#[derive(Default)]
pub(crate) struct Ledger {
    undo: Vec<Box<dyn FnOnce() + Send>>,
}

impl Ledger {
    pub(crate) fn record(&mut self, undo: impl FnOnce() + Send + 'static) {
        self.undo.push(Box::new(undo));
    }

    /// Moves every entry of `other` into this ledger, keeping their order.
    pub(crate) fn absorb(&mut self, other: Ledger) {
        self.undo.extend(other.undo);
    }

    /// Reverts recorded changes, newest first.
    pub(crate) fn rollback(self) {
        for undo in self.undo.into_iter().rev() {
            undo();
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.undo.len()
    }
}
