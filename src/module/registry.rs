//! # Module type registry: descriptors instead of reflection.
//!
//! Each module type registers an instantiation descriptor: a constructor
//! closure, a singleton marker, and a list of required-member setters. The
//! agent walks the descriptor where a reflective runtime would walk
//! constructor parameter lists.
//!
//! ## Resolution priority (inside the build closure)
//! A constructor parameter resolves, in order, to:
//! 1. a value from the external service provider ([`InsertScope::service`]),
//! 2. the agent itself ([`InsertScope::agent`]),
//! 3. an existing module of the concrete type, else a recursively inserted
//!    one ([`InsertScope::module`]),
//! 4. an existing module matching a probe ([`InsertScope::module_matching`]).
//!
//! Every module-valued resolution records a reverse required-by edge used by
//! batch removal.
//!
//! ## Rules
//! - Descriptors are cached process-wide; population is idempotent and reads
//!   are lock-free after publication.
//! - A required member's type must differ from the declaring type; cycles
//!   fail with `DependencyUnresolved`.
//!
//! ## Example
//! ```rust
//! use std::sync::{Arc, OnceLock};
//! use modvisor::{
//!     downcast_module, Module, ModuleContext, ModuleDescriptor, Registered,
//! };
//!
//! struct Store {
//!     ctx: ModuleContext,
//! }
//!
//! impl Module for Store {
//!     fn context(&self) -> &ModuleContext {
//!         &self.ctx
//!     }
//! }
//!
//! impl Registered for Store {
//!     fn descriptor() -> ModuleDescriptor {
//!         ModuleDescriptor::new::<Store>(|scope| Ok(Arc::new(Store { ctx: scope.context() })))
//!             .singleton()
//!     }
//! }
//!
//! struct Cache {
//!     ctx: ModuleContext,
//!     store: OnceLock<Arc<Store>>,
//! }
//!
//! impl Module for Cache {
//!     fn context(&self) -> &ModuleContext {
//!         &self.ctx
//!     }
//! }
//!
//! impl Registered for Cache {
//!     fn descriptor() -> ModuleDescriptor {
//!         ModuleDescriptor::new::<Cache>(|scope| {
//!             Ok(Arc::new(Cache {
//!                 ctx: scope.context(),
//!                 store: OnceLock::new(),
//!             }))
//!         })
//!         .requires("store", |module, scope| {
//!             let store = scope.module::<Store>()?;
//!             let _ = downcast_module::<Cache>(module)?.store.set(store);
//!             Ok(())
//!         })
//!     }
//! }
//! ```

use std::any::TypeId;
use std::sync::{Arc, LazyLock};

use dashmap::DashMap;

use crate::agent::InsertScope;
use crate::error::AgentError;

use super::module::{Module, ModuleRef};

/// Constructor closure stored in a descriptor.
type BuildFn =
    Arc<dyn for<'a> Fn(&mut InsertScope<'a>) -> Result<ModuleRef, AgentError> + Send + Sync>;

/// Setter closure for one required member.
type AssignFn =
    Arc<dyn for<'a> Fn(&ModuleRef, &mut InsertScope<'a>) -> Result<(), AgentError> + Send + Sync>;

/// One required-member declaration: resolve (or insert) the dependency, then
/// assign it into the freshly constructed module.
#[derive(Clone)]
pub struct RequiredMember {
    pub(crate) member: &'static str,
    pub(crate) assign: AssignFn,
}

/// Instantiation descriptor for a module type.
///
/// Built once per type by [`Registered::descriptor`] and cached process-wide.
#[derive(Clone)]
pub struct ModuleDescriptor {
    pub(crate) type_id: TypeId,
    pub(crate) type_name: &'static str,
    pub(crate) singleton: bool,
    pub(crate) build: BuildFn,
    pub(crate) required: Vec<RequiredMember>,
}

impl ModuleDescriptor {
    /// Creates a descriptor for `T` with the given constructor closure.
    ///
    /// The closure receives the [`InsertScope`] it resolves parameters
    /// through; call [`InsertScope::context`] for the module's own context.
    pub fn new<T: Module>(
        build: impl for<'a> Fn(&mut InsertScope<'a>) -> Result<Arc<T>, AgentError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            singleton: false,
            build: Arc::new(move |scope| build(scope).map(|m| m as ModuleRef)),
            required: Vec::new(),
        }
    }

    /// Marks the type as a singleton: at most one instance per agent; adding
    /// again configures the existing instance instead.
    pub fn singleton(mut self) -> Self {
        self.singleton = true;
        self
    }

    /// Declares a required member.
    ///
    /// After construction and insertion, `assign` runs with the new module
    /// and the scope; it resolves (or recursively inserts) the dependency and
    /// stores it into the member.
    pub fn requires(
        mut self,
        member: &'static str,
        assign: impl for<'a> Fn(&ModuleRef, &mut InsertScope<'a>) -> Result<(), AgentError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.required.push(RequiredMember {
            member,
            assign: Arc::new(assign),
        });
        self
    }

    /// Short display name of the described type.
    pub(crate) fn display_name(&self) -> &'static str {
        super::short_type_name(self.type_name)
    }
}

/// Module types the agent can instantiate on its own.
pub trait Registered: Module + Sized {
    /// The type's instantiation descriptor. Called at most once per process;
    /// the result is cached.
    fn descriptor() -> ModuleDescriptor;
}

/// Process-wide descriptor cache. Single-writer population per entry, reads
/// lock-free after publication.
static DESCRIPTORS: LazyLock<DashMap<TypeId, Arc<ModuleDescriptor>>> = LazyLock::new(DashMap::new);

/// Returns the cached descriptor for `T`, populating the cache on first use.
pub(crate) fn descriptor_of<T: Registered>() -> Arc<ModuleDescriptor> {
    DESCRIPTORS
        .entry(TypeId::of::<T>())
        .or_insert_with(|| Arc::new(T::descriptor()))
        .clone()
}
