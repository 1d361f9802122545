//! Event filters.
//!
//! Raw watch events are far noisier than the state the operator derives from
//! them: status churn, unrelated label edits and spec changes on unmanaged
//! VPAs must not wake a reconciler. Each filter is a stateless value with one
//! pure predicate per event kind; [`filter_events`] adapts a watcher stream
//! by remembering the previously observed object per key and consulting the
//! predicate, so only meaningful transitions become reconcile triggers.
//!
//! Replayed re-list events compare equal to the remembered state and are
//! swallowed, which keeps watch restarts from turning into reconcile storms.

use std::collections::HashMap;

use futures::{Stream, StreamExt, future};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::DynamicObject;
use kube::runtime::watcher;
use kube::{Resource, ResourceExt};

use crate::vpa;

/// Pure per-event predicates deciding whether an event becomes a trigger.
pub trait LifecycleFilter<K> {
    fn on_create(&self, obj: &K) -> bool;
    fn on_update(&self, old: &K, new: &K) -> bool;
    fn on_delete(&self, obj: &K) -> bool;
}

/// Workload filter: profile-annotation lifecycle.
///
/// A workload without the profile annotation cannot produce a managed VPA,
/// and spec or status edits never change VPA derivation. Annotation value
/// changes must fire because they may change the rendered VPA name; the
/// deletionTimestamp transition fires so cleanup starts promptly.
#[derive(Clone, Debug)]
pub struct ProfileAnnotationLifecycle {
    profile_key: String,
}

impl ProfileAnnotationLifecycle {
    pub fn new(profile_key: impl Into<String>) -> Self {
        Self {
            profile_key: profile_key.into(),
        }
    }

    fn opted_in<K: Resource>(&self, obj: &K) -> bool {
        annotation_value(obj, &self.profile_key).is_some_and(|v| !v.is_empty())
    }
}

impl<K: Resource> LifecycleFilter<K> for ProfileAnnotationLifecycle {
    fn on_create(&self, obj: &K) -> bool {
        self.opted_in(obj)
    }

    fn on_update(&self, old: &K, new: &K) -> bool {
        let was = self.opted_in(old);
        let is = self.opted_in(new);
        was != is
            || (is && annotation_value(old, &self.profile_key) != annotation_value(new, &self.profile_key))
            || deletion_started(old, new)
    }

    fn on_delete(&self, obj: &K) -> bool {
        annotation_value(obj, &self.profile_key).is_some()
    }
}

/// Safety-net filter: structural transitions on managed VPAs only.
///
/// The safety net checks ownership, so it must not rerun on content edits.
#[derive(Clone, Debug)]
pub struct ManagedVpaStructural {
    managed_label: String,
}

impl ManagedVpaStructural {
    pub fn new(managed_label: impl Into<String>) -> Self {
        Self {
            managed_label: managed_label.into(),
        }
    }
}

impl LifecycleFilter<DynamicObject> for ManagedVpaStructural {
    fn on_create(&self, obj: &DynamicObject) -> bool {
        vpa::is_managed(obj, &self.managed_label)
    }

    fn on_update(&self, old: &DynamicObject, new: &DynamicObject) -> bool {
        vpa::is_managed(old, &self.managed_label) != vpa::is_managed(new, &self.managed_label)
            || deletion_started(old, new)
            || controller_owner_key(old) != controller_owner_key(new)
    }

    fn on_delete(&self, obj: &DynamicObject) -> bool {
        vpa::is_managed(obj, &self.managed_label)
    }
}

/// Workload-controller filter for owned VPAs: structural transitions plus
/// content drift (operator-owned labels or spec).
///
/// Drift has to requeue the owning workload so it snaps back; VPAs that were
/// never managed stay invisible to the operator.
#[derive(Clone, Debug)]
pub struct ManagedVpaContent {
    managed_label: String,
    profile_key: String,
}

impl ManagedVpaContent {
    pub fn new(managed_label: impl Into<String>, profile_key: impl Into<String>) -> Self {
        Self {
            managed_label: managed_label.into(),
            profile_key: profile_key.into(),
        }
    }
}

impl LifecycleFilter<DynamicObject> for ManagedVpaContent {
    fn on_create(&self, obj: &DynamicObject) -> bool {
        vpa::is_managed(obj, &self.managed_label)
    }

    fn on_update(&self, old: &DynamicObject, new: &DynamicObject) -> bool {
        let was = vpa::is_managed(old, &self.managed_label);
        let is = vpa::is_managed(new, &self.managed_label);
        if !was && !is {
            return false;
        }

        was != is
            || deletion_started(old, new)
            || controller_owner_key(old) != controller_owner_key(new)
            || old.labels().get(&self.profile_key) != new.labels().get(&self.profile_key)
            || vpa::spec(old) != vpa::spec(new)
    }

    fn on_delete(&self, obj: &DynamicObject) -> bool {
        vpa::is_managed(obj, &self.managed_label)
    }
}

/// Adapt a watcher event stream into a trigger stream.
///
/// Keeps the last observed object per key so update events can be judged as
/// (old, new) pairs. Init markers are consumed; watch errors pass through so
/// the controller's backoff still sees them.
pub fn filter_events<K, F, S>(events: S, filter: F) -> impl Stream<Item = Result<K, watcher::Error>>
where
    K: Resource + Clone + Send + 'static,
    F: LifecycleFilter<K> + Send + 'static,
    S: Stream<Item = Result<watcher::Event<K>, watcher::Error>> + Send + 'static,
{
    let seen: HashMap<(Option<String>, String), K> = HashMap::new();
    events
        .scan((seen, filter), |state, item| {
            let (seen, filter) = state;
            let out = match item {
                Ok(watcher::Event::Apply(obj)) | Ok(watcher::Event::InitApply(obj)) => {
                    let key = (obj.meta().namespace.clone(), obj.name_any());
                    let pass = match seen.get(&key) {
                        Some(prev) => filter.on_update(prev, &obj),
                        None => filter.on_create(&obj),
                    };
                    seen.insert(key, obj.clone());
                    pass.then_some(Ok(obj))
                }
                Ok(watcher::Event::Delete(obj)) => {
                    seen.remove(&(obj.meta().namespace.clone(), obj.name_any()));
                    filter.on_delete(&obj).then_some(Ok(obj))
                }
                Ok(watcher::Event::Init) | Ok(watcher::Event::InitDone) => None,
                Err(e) => Some(Err(e)),
            };
            future::ready(Some(out))
        })
        .filter_map(future::ready)
}

fn annotation_value<'a, K: Resource>(obj: &'a K, key: &str) -> Option<&'a str> {
    obj.meta()
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}

fn deletion_started<K: Resource>(old: &K, new: &K) -> bool {
    old.meta().deletion_timestamp.is_none() && new.meta().deletion_timestamp.is_some()
}

/// Identity of the controller owner ref, for change detection.
fn controller_owner_key(obj: &DynamicObject) -> Option<(&str, &str, &str)> {
    vpa::controller_owner(obj).map(|r: &OwnerReference| {
        (r.kind.as_str(), r.name.as_str(), r.uid.as_str())
    })
}
