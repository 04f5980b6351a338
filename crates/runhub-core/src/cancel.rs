//! Hierarchical cancellation scopes
//!
//! Scopes live in a single arena and are addressed by generation-checked handles,
//! so no scope owns a pointer to its parent or children. Cancelling a scope cancels
//! its whole subtree. The process keeps one root; every program, execution and
//! connection scope hangs below it:
//!
//! ```text
//! root ─┬─ program ── execution
//!       └─ connection
//! ```

use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

/// Generation-checked index into the scope arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeHandle {
    index: usize,
    generation: u64,
}

struct Node {
    generation: u64,
    parent: Option<usize>,
    children: Vec<usize>,
    cancelled: bool,
    signal: watch::Sender<bool>,
}

#[derive(Default)]
struct Arena {
    slots: Vec<Option<Node>>,
    free: Vec<usize>,
    next_generation: u64,
}

impl Arena {
    fn node(&self, handle: ScopeHandle) -> Option<&Node> {
        self.slots
            .get(handle.index)
            .and_then(|slot| slot.as_ref())
            .filter(|node| node.generation == handle.generation)
    }

    fn allocate(&mut self, parent: Option<usize>, cancelled: bool) -> ScopeHandle {
        self.next_generation += 1;
        let (signal, _) = watch::channel(cancelled);
        let node = Node {
            generation: self.next_generation,
            parent,
            children: Vec::new(),
            cancelled,
            signal,
        };
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(node);
                index
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };
        ScopeHandle {
            index,
            generation: self.next_generation,
        }
    }

    fn cancel_subtree(&mut self, index: usize) {
        let mut pending = vec![index];
        while let Some(current) = pending.pop() {
            if let Some(node) = self.slots[current].as_mut() {
                if !node.cancelled {
                    node.cancelled = true;
                    node.signal.send_replace(true);
                }
                pending.extend(node.children.iter().copied());
            }
        }
    }
}

/// Arena holding every live cancellation scope.
pub struct ScopeTree {
    arena: Mutex<Arena>,
    root: ScopeHandle,
}

impl ScopeTree {
    pub fn new() -> Arc<Self> {
        let mut arena = Arena::default();
        let root = arena.allocate(None, false);
        Arc::new(Self {
            arena: Mutex::new(arena),
            root,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Arena> {
        // A panic while holding the arena lock leaves plain data behind; keep going.
        self.arena.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn root(self: &Arc<Self>) -> Scope {
        Scope {
            tree: Arc::clone(self),
            handle: self.root,
        }
    }

    /// Creates a child scope. A child of a cancelled or released scope starts cancelled.
    pub fn child(&self, parent: ScopeHandle) -> ScopeHandle {
        let mut arena = self.lock();
        let parent_state = arena.node(parent).map(|node| node.cancelled);
        match parent_state {
            Some(cancelled) => {
                let handle = arena.allocate(Some(parent.index), cancelled);
                if let Some(node) = arena.slots[parent.index].as_mut() {
                    node.children.push(handle.index);
                }
                handle
            }
            None => arena.allocate(None, true),
        }
    }

    pub fn cancel(&self, handle: ScopeHandle) {
        let mut arena = self.lock();
        if arena.node(handle).is_some() {
            arena.cancel_subtree(handle.index);
        }
    }

    /// Released and unknown handles report as cancelled.
    pub fn is_cancelled(&self, handle: ScopeHandle) -> bool {
        self.lock().node(handle).map_or(true, |node| node.cancelled)
    }

    /// Cancels the scope and frees its slot. Children survive as detached roots of
    /// their own subtrees, already cancelled.
    pub fn release(&self, handle: ScopeHandle) {
        if handle == self.root {
            self.cancel(handle);
            return;
        }
        let mut arena = self.lock();
        if arena.node(handle).is_none() {
            return;
        }
        arena.cancel_subtree(handle.index);
        let node = match arena.slots[handle.index].take() {
            Some(node) => node,
            None => return,
        };
        if let Some(parent) = node.parent {
            if let Some(parent_node) = arena.slots[parent].as_mut() {
                parent_node.children.retain(|child| *child != handle.index);
            }
        }
        for child in &node.children {
            if let Some(child_node) = arena.slots[*child].as_mut() {
                child_node.parent = None;
            }
        }
        arena.free.push(handle.index);
    }

    /// Resolves once the scope is cancelled or released.
    pub async fn cancelled(&self, handle: ScopeHandle) {
        let receiver = {
            let arena = self.lock();
            match arena.node(handle) {
                Some(node) if !node.cancelled => node.signal.subscribe(),
                _ => return,
            }
        };
        let mut receiver = receiver;
        // A closed channel means the scope was released, which implies cancellation.
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }

    pub fn live_scopes(&self) -> usize {
        self.lock().slots.iter().filter(|slot| slot.is_some()).count()
    }
}

/// Owned reference to one scope of a [`ScopeTree`].
#[derive(Clone)]
pub struct Scope {
    tree: Arc<ScopeTree>,
    handle: ScopeHandle,
}

impl Scope {
    pub fn handle(&self) -> ScopeHandle {
        self.handle
    }

    pub fn child(&self) -> Scope {
        Scope {
            tree: Arc::clone(&self.tree),
            handle: self.tree.child(self.handle),
        }
    }

    pub fn cancel(&self) {
        self.tree.cancel(self.handle);
    }

    pub fn is_cancelled(&self) -> bool {
        self.tree.is_cancelled(self.handle)
    }

    pub fn release(&self) {
        self.tree.release(self.handle);
    }

    pub async fn cancelled(&self) {
        self.tree.cancelled(self.handle).await;
    }
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("handle", &self.handle)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_cancel_propagates_down_only() {
        let tree = ScopeTree::new();
        let root = tree.root();
        let program = root.child();
        let first = program.child();
        let sibling_program = root.child();

        program.cancel();

        assert!(program.is_cancelled());
        assert!(first.is_cancelled());
        assert!(!root.is_cancelled());
        assert!(!sibling_program.is_cancelled());
    }

    #[test]
    fn test_child_of_cancelled_scope_starts_cancelled() {
        let tree = ScopeTree::new();
        let program = tree.root().child();
        program.cancel();
        assert!(program.child().is_cancelled());
    }

    #[test]
    fn test_release_recycles_slot_without_reviving_handle() {
        let tree = ScopeTree::new();
        let root = tree.root();
        let execution = root.child();
        let stale = execution.handle();
        execution.release();

        let reused = root.child();
        assert!(!reused.is_cancelled());
        assert!(tree.is_cancelled(stale));
        assert_eq!(tree.live_scopes(), 2);
    }

    #[test]
    fn test_release_detaches_children() {
        let tree = ScopeTree::new();
        let program = tree.root().child();
        let execution = program.child();
        program.release();
        assert!(execution.is_cancelled());
        execution.release();
        assert_eq!(tree.live_scopes(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiters() {
        let tree = ScopeTree::new();
        let root = tree.root();
        let execution = root.child().child();
        let waiter = {
            let execution = execution.clone();
            tokio::spawn(async move { execution.cancelled().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        root.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_returns_for_released_scope() {
        let tree = ScopeTree::new();
        let scope = tree.root().child();
        scope.release();
        tokio::time::timeout(Duration::from_millis(100), scope.cancelled())
            .await
            .unwrap();
    }
}
