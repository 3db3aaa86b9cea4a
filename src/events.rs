/// Change notification emitted by the store after every committed write.
///
/// Subscribers get the doc id and new revision and look the fresh document
/// up themselves; nothing hands out live aliases into the store.
#[derive(Debug, Clone, PartialEq)]
pub struct DocChanged {
    pub doc_id: String,
    pub new_rev: String,
}

type Observer = Box<dyn Fn(&DocChanged) + Send + Sync>;

/// Registry of change observers.
#[derive(Default)]
pub struct ObserverRegistry {
    observers: Vec<Observer>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, observer: impl Fn(&DocChanged) + Send + Sync + 'static) {
        self.observers.push(Box::new(observer));
    }

    pub fn notify(&self, event: &DocChanged) {
        for observer in &self.observers {
            observer(event);
        }
    }
}
