//! User-supplied hooks and the literal-or-computed indirection.
//!
//! Declarations embed behaviour (`set`, `get`, `validate`, defaults,
//! lifecycle hooks, custom populate resolvers, scope functions). All of them
//! are stored as a [`Hook`], an `Arc`ed async closure, and every place in the
//! pipeline that may receive either a constant or a function goes through
//! [`Resolvable::resolve`].

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{Map, Value};

use crate::error::EntityResult;
use crate::tenant::OperationContext;

use super::types::Operation;

/// Arguments handed to field hooks.
#[derive(Debug, Clone)]
pub struct HookArgs {
    /// The candidate value (`None` when the caller did not supply one).
    pub value: Option<Value>,
    /// The entity being written or read, keyed by field name on writes and
    /// by output name on reads.
    pub entity: Map<String, Value>,
    /// Name of the field the hook is attached to.
    pub field: String,
    /// The write operation, or `None` on the read path.
    pub operation: Option<Operation>,
    /// The stored entity before this write (update, replace, remove).
    pub previous: Option<Map<String, Value>>,
    /// The caller context.
    pub ctx: OperationContext,
}

impl HookArgs {
    /// Creates arguments for a hook on the given field.
    pub fn new(field: impl Into<String>, ctx: OperationContext) -> Self {
        Self {
            value: None,
            entity: Map::new(),
            field: field.into(),
            operation: None,
            previous: None,
            ctx,
        }
    }

    /// Sets the candidate value.
    pub fn with_value(mut self, value: Option<Value>) -> Self {
        self.value = value;
        self
    }

    /// Sets the entity snapshot.
    pub fn with_entity(mut self, entity: Map<String, Value>) -> Self {
        self.entity = entity;
        self
    }

    /// Sets the write operation.
    pub fn with_operation(mut self, operation: Operation) -> Self {
        self.operation = Some(operation);
        self
    }

    /// Sets the stored entity before the write.
    pub fn with_previous(mut self, previous: Option<Map<String, Value>>) -> Self {
        self.previous = previous;
        self
    }
}

type HookFn<T, A> = dyn Fn(A) -> BoxFuture<'static, EntityResult<T>> + Send + Sync;

/// A shareable async callback.
///
/// Hooks compare equal only when they are the same allocation, so cloning a
/// declaration keeps its descriptors comparable.
///
/// # Examples
///
/// ```
/// use helios_entity::field::{Hook, HookArgs};
/// use serde_json::{json, Value};
///
/// // async hook
/// let upper: Hook = Hook::new(|args: HookArgs| async move {
///     let s = args.value.as_ref().and_then(Value::as_str).unwrap_or_default();
///     Ok(json!(s.to_uppercase()))
/// });
///
/// // synchronous hook
/// let now: Hook = Hook::sync(|_args| Ok(json!(0)));
/// # let _ = (upper, now);
/// ```
pub struct Hook<T = Value, A = HookArgs>(Arc<HookFn<T, A>>);

impl<T, A> Hook<T, A>
where
    T: Send + 'static,
    A: Send + 'static,
{
    /// Wraps an async closure.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = EntityResult<T>> + Send + 'static,
    {
        Self(Arc::new(move |args| -> BoxFuture<'static, EntityResult<T>> {
            Box::pin(f(args))
        }))
    }

    /// Wraps a synchronous closure.
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(A) -> EntityResult<T> + Send + Sync + 'static,
    {
        Self::new(move |args| {
            let result = f(args);
            async move { result }
        })
    }

    /// Invokes the hook.
    pub async fn call(&self, args: A) -> EntityResult<T> {
        (self.0)(args).await
    }
}

impl<T, A> Clone for Hook<T, A> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T, A> PartialEq for Hook<T, A> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl<T, A> fmt::Debug for Hook<T, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Hook(..)")
    }
}

/// Either a constant or a hook computing the value at request time.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolvable {
    /// Used as-is (cloned per use).
    Literal(Value),
    /// Invoked with the field's [`HookArgs`].
    Computed(Hook),
}

impl Resolvable {
    /// Produces the value.
    pub async fn resolve(&self, args: HookArgs) -> EntityResult<Value> {
        match self {
            Resolvable::Literal(value) => Ok(value.clone()),
            Resolvable::Computed(hook) => hook.call(args).await,
        }
    }

    /// Returns the constant, if this is one.
    pub fn literal(&self) -> Option<&Value> {
        match self {
            Resolvable::Literal(value) => Some(value),
            Resolvable::Computed(_) => None,
        }
    }

    /// Returns `true` if this is evaluated at request time.
    pub fn is_computed(&self) -> bool {
        matches!(self, Resolvable::Computed(_))
    }
}

impl From<Value> for Resolvable {
    fn from(value: Value) -> Self {
        Resolvable::Literal(value)
    }
}

impl From<Hook> for Resolvable {
    fn from(hook: Hook) -> Self {
        Resolvable::Computed(hook)
    }
}
