//! Fiber-local environment.
//!
//! An [`EnvRef`] is a typed key into a fiber's [`Env`]. Each ref carries two merge
//! functions: `fork` computes the value a child starts with, and `join` computes
//! what the parent holds after it successfully observes the child's exit.
//!
//! An [`Env`] is an immutable, copy-on-write map. A fiber owns exactly one `Env`;
//! forking clones the map (cheaply, through `Arc`) for the child, so no two fibers
//! ever alias a mutable environment.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::effect::{Effect, Node};
use crate::erased::{AnyValue, ErasedCause, Payload, erase, guard, unerase};

static NEXT_ENV_KEY: AtomicU64 = AtomicU64::new(1);

/// Identity of an [`EnvRef`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EnvKey(u64);

impl EnvKey {
    fn next() -> Self {
        EnvKey(NEXT_ENV_KEY.fetch_add(1, Ordering::Relaxed))
    }
}

type ForkFn = Arc<dyn Fn(&AnyValue) -> AnyValue + Send + Sync>;
type JoinFn = Arc<dyn Fn(&AnyValue, &AnyValue) -> AnyValue + Send + Sync>;

/// Untyped definition shared by every copy of an [`EnvRef`].
pub(crate) struct RefDef {
    key: EnvKey,
    initial: AnyValue,
    fork: ForkFn,
    join: JoinFn,
}

/// A typed, fiber-local variable.
///
/// Cloning an `EnvRef` yields another handle to the same variable.
pub struct EnvRef<A> {
    def: Arc<RefDef>,
    _marker: PhantomData<fn() -> A>,
}

impl<A> Clone for EnvRef<A> {
    fn clone(&self) -> Self {
        Self {
            def: self.def.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A> fmt::Debug for EnvRef<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvRef").field("key", &self.def.key).finish()
    }
}

impl<A: Payload> EnvRef<A> {
    /// Create a ref whose children start with the parent's value and whose joins
    /// overwrite the parent with the child's value.
    pub fn new(initial: A) -> Self {
        Self::with_merge(initial, A::clone, |_parent, child| child.clone())
    }

    /// Create a ref with custom fork and join functions.
    ///
    /// `fork(parent)` is the value a forked child starts with; `join(parent, child)`
    /// is what the parent holds after joining a child that touched the ref.
    pub fn with_merge(
        initial: A,
        fork: impl Fn(&A) -> A + Send + Sync + 'static,
        join: impl Fn(&A, &A) -> A + Send + Sync + 'static,
    ) -> Self {
        let fork: ForkFn = Arc::new(move |value: &AnyValue| erase(fork(&unerase::<A>(value))));
        let join: JoinFn = Arc::new(move |parent: &AnyValue, child: &AnyValue| erase(join(&unerase::<A>(parent), &unerase::<A>(child))));
        Self {
            def: Arc::new(RefDef {
                key: EnvKey::next(),
                initial: erase(initial),
                fork,
                join,
            }),
            _marker: PhantomData,
        }
    }

    /// Create a ref and register it in the running fiber's environment, so that
    /// fibers forked afterwards receive `fork(initial)`.
    pub fn make<E: Payload>(initial: A) -> Effect<EnvRef<A>, E> {
        let env_ref = Self::new(initial);
        env_ref.register()
    }

    /// [`EnvRef::make`] with custom fork and join functions.
    pub fn make_with<E: Payload>(
        initial: A,
        fork: impl Fn(&A) -> A + Send + Sync + 'static,
        join: impl Fn(&A, &A) -> A + Send + Sync + 'static,
    ) -> Effect<EnvRef<A>, E> {
        let env_ref = Self::with_merge(initial, fork, join);
        env_ref.register()
    }

    fn register<E: Payload>(self) -> Effect<EnvRef<A>, E> {
        let initial = self.initial();
        self.set(initial).as_value(self)
    }

    pub fn key(&self) -> EnvKey {
        self.def.key
    }

    /// Value seen by a fiber whose environment has never held this ref.
    pub fn initial(&self) -> A {
        unerase(&self.def.initial)
    }

    /// Read the running fiber's value.
    pub fn get<E: Payload>(&self) -> Effect<A, E> {
        Effect::from_node(Node::ReadEnv(self.def.clone()))
    }

    /// Replace the running fiber's value.
    pub fn set<E: Payload>(&self, value: A) -> Effect<(), E> {
        self.modify(move |_| ((), value.clone()))
    }

    /// Transform the running fiber's value.
    pub fn update<E: Payload>(&self, f: impl Fn(A) -> A + Send + Sync + 'static) -> Effect<(), E> {
        self.modify(move |current| ((), f(current)))
    }

    /// Atomically compute a result and a replacement value from the current value.
    pub fn modify<B: Payload, E: Payload>(&self, f: impl Fn(A) -> (B, A) + Send + Sync + 'static) -> Effect<B, E> {
        Effect::from_node(Node::UpdateEnv(
            self.def.clone(),
            Arc::new(move |current: &AnyValue| {
                let (output, next) = f(unerase::<A>(current));
                (erase(output), erase(next))
            }),
        ))
    }

    /// Run `effect` with the ref set to `value`, restoring the previous value
    /// afterwards whether `effect` succeeds, fails or is interrupted.
    pub fn locally<B: Payload, E: Payload>(&self, value: A, effect: Effect<B, E>) -> Effect<B, E> {
        let env_ref = self.clone();
        Effect::uninterruptible_mask(move |restore| {
            let env_ref = env_ref.clone();
            let value = value.clone();
            let effect = effect.clone();
            env_ref.get().flat_map(move |previous: A| {
                let body = restore.apply(env_ref.set(value.clone()).zip_right(effect.clone()));
                body.ensuring(env_ref.set(previous))
            })
        })
    }
}

#[derive(Clone)]
struct Slot {
    def: Arc<RefDef>,
    value: AnyValue,
    touched: bool,
}

/// Immutable, copy-on-write map from [`EnvRef`] identity to value.
#[derive(Clone, Default)]
pub struct Env {
    slots: Arc<HashMap<EnvKey, Slot>>,
}

impl fmt::Debug for Env {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.slots.keys().collect();
        keys.sort();
        f.debug_struct("Env").field("refs", &keys).finish()
    }
}

impl Env {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Seed a value, typically before handing the environment to a root fiber.
    pub fn with<A: Payload>(mut self, env_ref: &EnvRef<A>, value: A) -> Self {
        self.write(&env_ref.def, erase(value));
        self
    }

    /// Current value of `env_ref`, or its initial value when absent.
    pub fn get<A: Payload>(&self, env_ref: &EnvRef<A>) -> A {
        unerase(&self.read(&env_ref.def))
    }

    pub fn contains<A>(&self, env_ref: &EnvRef<A>) -> bool {
        self.slots.contains_key(&env_ref.def.key)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub(crate) fn read(&self, def: &Arc<RefDef>) -> AnyValue {
        match self.slots.get(&def.key) {
            Some(slot) => slot.value.clone(),
            None => def.initial.clone(),
        }
    }

    pub(crate) fn write(&mut self, def: &Arc<RefDef>, value: AnyValue) {
        Arc::make_mut(&mut self.slots).insert(
            def.key,
            Slot {
                def: def.clone(),
                value,
                touched: true,
            },
        );
    }

    /// Environment for a new child: every ref passes through its `fork` function
    /// and starts untouched.
    pub(crate) fn fork(&self) -> Result<Env, ErasedCause> {
        let mut slots = HashMap::with_capacity(self.slots.len());
        for (key, slot) in self.slots.iter() {
            let value = guard(|| (slot.def.fork)(&slot.value))?;
            slots.insert(
                *key,
                Slot {
                    def: slot.def.clone(),
                    value,
                    touched: false,
                },
            );
        }
        Ok(Env { slots: Arc::new(slots) })
    }

    /// Merge a successfully completed child's environment: every ref the child
    /// touched becomes `join(parent, child)`.
    pub(crate) fn join_from(&mut self, child: &Env) -> Result<(), ErasedCause> {
        for slot in child.slots.values().filter(|slot| slot.touched) {
            let parent_value = self.read(&slot.def);
            let merged = guard(|| (slot.def.join)(&parent_value, &slot.value))?;
            self.write(&slot.def, merged);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_refs_read_their_initial_value() {
        let counter = EnvRef::new(7u32);
        let env = Env::empty();
        assert_eq!(env.get(&counter), 7);
        assert!(!env.contains(&counter));
    }

    #[test]
    fn writes_do_not_affect_earlier_copies() {
        let name = EnvRef::new(String::from("root"));
        let original = Env::empty().with(&name, "parent".to_string());
        let copy = original.clone().with(&name, "changed".to_string());
        assert_eq!(original.get(&name), "parent");
        assert_eq!(copy.get(&name), "changed");
    }

    #[test]
    fn fork_applies_fork_function_and_clears_touched() {
        let depth = EnvRef::with_merge(0u32, |value| value + 1, |_, child| *child);
        let parent = Env::empty().with(&depth, 0);
        let child = parent.fork().expect("fork env");
        let grandchild = child.fork().expect("fork env");
        assert_eq!(child.get(&depth), 1);
        assert_eq!(grandchild.get(&depth), 2);
        assert_eq!(parent.get(&depth), 0);

        let mut joined = parent.clone();
        joined.join_from(&child).expect("join env");
        assert_eq!(joined.get(&depth), 0, "untouched refs are not merged back");
    }

    #[test]
    fn join_uses_custom_merge() {
        let high_water = EnvRef::with_merge(0u32, u32::clone, |parent, child| (*parent).max(*child));
        let parent = Env::empty().with(&high_water, 0);
        let child = parent.fork().expect("fork env").with(&high_water, 1);
        let mut updated_parent = parent.with(&high_water, 2);
        updated_parent.join_from(&child).expect("join env");
        assert_eq!(updated_parent.get(&high_water), 2);
    }

    #[test]
    fn join_brings_in_refs_created_by_the_child() {
        let tag = EnvRef::new("none");
        let mut parent = Env::empty();
        let child = parent.fork().expect("fork env").with(&tag, "child");
        parent.join_from(&child).expect("join env");
        assert_eq!(parent.get(&tag), "child");
    }

    #[test]
    fn panicking_merge_functions_become_defects() {
        let fragile = EnvRef::with_merge(0u8, |_| panic!("fork exploded"), |_, child| *child);
        let env = Env::empty().with(&fragile, 1);
        let cause = env.fork().expect_err("fork panics");
        assert!(cause.is_die());
    }
}
