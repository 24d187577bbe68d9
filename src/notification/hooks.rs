//! Extension points around send and dismiss.
//!
//! Filters run before a notification is stored and may rewrite or veto it.
//! Actions observe completed sends and dismissals. Both run in ascending
//! priority order (ties keep insertion order) and are awaited one at a time.

use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use uuid::Uuid;

use super::types::Notification;

/// Pre-send filter. Returning `None` cancels the send.
#[async_trait]
pub trait SendFilter: Send + Sync {
    async fn filter(&self, source_key: &str, notification: Notification) -> Option<Notification>;
}

/// Post-send / post-dismiss observer.
#[async_trait]
pub trait NotificationAction: Send + Sync {
    async fn on_event(&self, event: &HookEvent);
}

#[derive(Debug, Clone)]
pub enum HookEvent {
    Sent {
        source_key: String,
        notification: Notification,
    },
    Dismissed {
        source_key: String,
        notification_id: Uuid,
    },
}

struct FnFilter<F>(F);

#[async_trait]
impl<F> SendFilter for FnFilter<F>
where
    F: Fn(&str, Notification) -> Option<Notification> + Send + Sync,
{
    async fn filter(&self, source_key: &str, notification: Notification) -> Option<Notification> {
        (self.0)(source_key, notification)
    }
}

struct FnAction<F>(F);

#[async_trait]
impl<F> NotificationAction for FnAction<F>
where
    F: Fn(&HookEvent) + Send + Sync,
{
    async fn on_event(&self, event: &HookEvent) {
        (self.0)(event)
    }
}

type Prioritized<T> = Vec<(i32, Arc<T>)>;

#[derive(Default)]
pub struct HookRegistry {
    filters: RwLock<Prioritized<dyn SendFilter>>,
    actions: RwLock<Prioritized<dyn NotificationAction>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_filter(&self, priority: i32, filter: Arc<dyn SendFilter>) {
        insert_sorted(&self.filters, priority, filter);
    }

    /// Register a synchronous filter closure.
    pub fn add_filter_fn<F>(&self, priority: i32, f: F)
    where
        F: Fn(&str, Notification) -> Option<Notification> + Send + Sync + 'static,
    {
        self.add_filter(priority, Arc::new(FnFilter(f)));
    }

    pub fn add_action(&self, priority: i32, action: Arc<dyn NotificationAction>) {
        insert_sorted(&self.actions, priority, action);
    }

    /// Register a synchronous action closure.
    pub fn add_action_fn<F>(&self, priority: i32, f: F)
    where
        F: Fn(&HookEvent) + Send + Sync + 'static,
    {
        self.add_action(priority, Arc::new(FnAction(f)));
    }

    /// Run every filter in order. `None` means some filter vetoed.
    pub async fn apply_filters(
        &self,
        source_key: &str,
        notification: Notification,
    ) -> Option<Notification> {
        let filters = snapshot(&self.filters);
        let mut current = notification;
        for filter in filters {
            current = filter.filter(source_key, current).await?;
        }
        Some(current)
    }

    pub async fn run_actions(&self, event: &HookEvent) {
        for action in snapshot(&self.actions) {
            action.on_event(event).await;
        }
    }
}

fn insert_sorted<T: ?Sized>(list: &RwLock<Prioritized<T>>, priority: i32, hook: Arc<T>) {
    let mut list = list.write().unwrap_or_else(PoisonError::into_inner);
    list.push((priority, hook));
    // stable: equal priorities keep registration order
    list.sort_by_key(|(p, _)| *p);
}

fn snapshot<T: ?Sized>(list: &RwLock<Prioritized<T>>) -> Vec<Arc<T>> {
    list.read()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .map(|(_, hook)| hook.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn append(mut n: Notification, tag: &str) -> Notification {
        let trail = n.payload.get("trail").and_then(|v| v.as_str()).unwrap_or("");
        let trail = format!("{}{}", trail, tag);
        n.payload.insert("trail".into(), trail.into());
        n
    }

    #[tokio::test]
    async fn test_filters_run_in_priority_order() {
        let hooks = HookRegistry::new();
        hooks.add_filter_fn(20, |_, n| Some(append(n, "b")));
        hooks.add_filter_fn(10, |_, n| Some(append(n, "a")));

        let out = hooks
            .apply_filters("global", Notification::builder("x").build())
            .await
            .unwrap();
        assert_eq!(out.payload["trail"], "ab");
    }

    #[tokio::test]
    async fn test_filter_veto_short_circuits() {
        let hooks = HookRegistry::new();
        let reached = Arc::new(Mutex::new(false));
        let flag = reached.clone();

        hooks.add_filter_fn(0, |_, _| None);
        hooks.add_filter_fn(1, move |_, n| {
            *flag.lock().unwrap() = true;
            Some(n)
        });

        assert!(hooks
            .apply_filters("global", Notification::builder("x").build())
            .await
            .is_none());
        assert!(!*reached.lock().unwrap());
    }

    #[tokio::test]
    async fn test_actions_keep_insertion_order_on_ties() {
        let hooks = HookRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for label in ["first", "second"] {
            let seen = seen.clone();
            hooks.add_action_fn(5, move |_| seen.lock().unwrap().push(label));
        }
        let early = seen.clone();
        hooks.add_action_fn(1, move |_| early.lock().unwrap().push("early"));

        hooks
            .run_actions(&HookEvent::Dismissed {
                source_key: "user:u1".into(),
                notification_id: Uuid::new_v4(),
            })
            .await;
        assert_eq!(*seen.lock().unwrap(), vec!["early", "first", "second"]);
    }
}
