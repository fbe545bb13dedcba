use super::dialog::Dialog;
use super::DialogId;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

struct DialogLayerInner {
    dialogs: RwLock<HashMap<DialogId, Dialog>>,
}

/// Table of active dialogs keyed by (Call-ID, local tag, remote tag).
/// Lookups fall back to the early half-key (empty remote tag) so
/// responses racing the first tagged one still find their dialog.
#[derive(Clone)]
pub struct DialogLayer {
    inner: Arc<DialogLayerInner>,
}

impl Default for DialogLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl DialogLayer {
    pub fn new() -> Self {
        DialogLayer {
            inner: Arc::new(DialogLayerInner {
                dialogs: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.dialogs.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn insert(&self, dialog: Dialog) {
        let id = dialog.id();
        debug!("dialog stored: {}", id);
        self.inner.dialogs.write().unwrap().insert(id, dialog);
    }

    /// Re-keys a dialog that gained its remote tag, dropping the early
    /// half-key entry.
    pub fn confirm_id(&self, old_id: &DialogId, dialog: Dialog) {
        let mut dialogs = self.inner.dialogs.write().unwrap();
        dialogs.remove(old_id);
        dialogs.remove(&DialogId {
            call_id: old_id.call_id.clone(),
            local_tag: old_id.local_tag.clone(),
            remote_tag: String::new(),
        });
        dialogs.insert(dialog.id(), dialog);
    }

    pub fn find(&self, id: &DialogId) -> Option<Dialog> {
        let dialogs = self.inner.dialogs.read().unwrap();
        if let Some(dialog) = dialogs.get(id) {
            return Some(dialog.clone());
        }
        // early dialog: match on Call-ID and local tag only
        let early = DialogId {
            call_id: id.call_id.clone(),
            local_tag: id.local_tag.clone(),
            remote_tag: String::new(),
        };
        dialogs.get(&early).cloned()
    }

    pub fn remove(&self, id: &DialogId) {
        debug!("dialog removed: {}", id);
        self.inner.dialogs.write().unwrap().remove(id);
    }
}
