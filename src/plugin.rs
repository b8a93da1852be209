//! Plugin modules and their handlers.
//!
//! A plugin is identified by name and lives at
//! `<plugin_dir>/lib<name>.<dll extension>`. Loading a plugin resolves one
//! optional handler per [`Action`] up front; the resulting [`PluginModule`]
//! is then cached by the [`PluginRegistry`] when retention is enabled.
//!
//! ## Loaders
//!
//! - [`DylibLoader`]: shared objects opened with `dlopen(RTLD_NOW | RTLD_GLOBAL)`,
//!   handlers looked up with `dlsym` by action symbol name (`execute`,
//!   `status`, `version`, `help`), each an `extern "C" fn()`.
//! - [`StaticLoader`]: handler sets registered in-process by name.
//!
//! A shared object stays mapped while any handler resolved from it is alive,
//! and is closed once the last one is dropped.

use crate::command::Action;
use std::collections::HashMap;
use std::ffi::{c_void, CStr, CString};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

/// A resolved plugin entry point.
#[derive(Clone)]
pub struct Handler {
    func: Arc<dyn Fn() + Send + Sync>,
}

impl Handler {
    pub fn new(func: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            func: Arc::new(func),
        }
    }

    /// Run the handler. Its output is not observed.
    pub fn invoke(&self) {
        (self.func)()
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Handler")
    }
}

/// Handlers a module provides, at most one per action.
#[derive(Debug, Clone, Default)]
pub struct HandlerSet {
    handlers: HashMap<Action, Handler>,
}

impl HandlerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style registration.
    pub fn with(mut self, action: Action, func: impl Fn() + Send + Sync + 'static) -> Self {
        self.insert(action, Handler::new(func));
        self
    }

    pub fn insert(&mut self, action: Action, handler: Handler) {
        self.handlers.insert(action, handler);
    }

    pub fn get(&self, action: Action) -> Option<&Handler> {
        self.handlers.get(&action)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Module loading errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    /// No module file at the path.
    NotFound(PathBuf),
    /// The module exists but could not be loaded.
    Open { path: PathBuf, reason: String },
}

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadError::NotFound(path) => write!(f, "No module at '{}'", path.display()),
            LoadError::Open { path, reason } => {
                write!(f, "Unable to open '{}': {}", path.display(), reason)
            }
        }
    }
}

impl std::error::Error for LoadError {}

/// Source of plugin modules.
pub trait ModuleLoader: Send + Sync {
    /// Load module `name` from `path` and resolve its handlers.
    fn load(&self, name: &str, path: &Path) -> Result<HandlerSet, LoadError>;
}

/// An open shared object.
struct Library {
    handle: NonNull<c_void>,
    path: PathBuf,
}

// The handle is only used through dlsym/dlclose, both thread-safe.
unsafe impl Send for Library {}
unsafe impl Sync for Library {}

impl Library {
    fn open(path: &Path) -> Result<Self, LoadError> {
        let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| LoadError::Open {
            path: path.to_path_buf(),
            reason: "path contains a NUL byte".to_string(),
        })?;

        // SAFETY: c_path is a valid NUL-terminated string. Loading runs the
        // module's initializers, which we trust by placement in the plugin
        // directory.
        let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW | libc::RTLD_GLOBAL) };

        match NonNull::new(handle) {
            Some(handle) => Ok(Self {
                handle,
                path: path.to_path_buf(),
            }),
            None => Err(LoadError::Open {
                path: path.to_path_buf(),
                reason: last_dl_error(),
            }),
        }
    }

    /// Look up a `void (*)(void)` symbol.
    fn symbol(&self, name: &str) -> Option<unsafe extern "C" fn()> {
        let c_name = CString::new(name).ok()?;
        // SAFETY: handle is open for the lifetime of self.
        let sym = unsafe { libc::dlsym(self.handle.as_ptr(), c_name.as_ptr()) };
        if sym.is_null() {
            return None;
        }
        // SAFETY: plugins export their action symbols as `void name(void)`.
        Some(unsafe { std::mem::transmute::<*mut c_void, unsafe extern "C" fn()>(sym) })
    }
}

impl Drop for Library {
    fn drop(&mut self) {
        debug!(path = %self.path.display(), "Closing plugin library");
        // SAFETY: handle came from a successful dlopen and is closed once.
        unsafe {
            libc::dlclose(self.handle.as_ptr());
        }
    }
}

fn last_dl_error() -> String {
    // SAFETY: dlerror returns NULL or a NUL-terminated string valid until the
    // next dl* call on this thread.
    unsafe {
        let err = libc::dlerror();
        if err.is_null() {
            "unknown dlopen error".to_string()
        } else {
            CStr::from_ptr(err).to_string_lossy().into_owned()
        }
    }
}

/// Loads plugins as shared objects.
#[derive(Debug, Default, Clone, Copy)]
pub struct DylibLoader;

impl ModuleLoader for DylibLoader {
    fn load(&self, name: &str, path: &Path) -> Result<HandlerSet, LoadError> {
        if !path.exists() {
            return Err(LoadError::NotFound(path.to_path_buf()));
        }

        let library = Arc::new(Library::open(path)?);
        let mut handlers = HandlerSet::new();
        for action in Action::ALL {
            if let Some(func) = library.symbol(action.symbol()) {
                let library = Arc::clone(&library);
                handlers.insert(
                    action,
                    Handler::new(move || {
                        let _library = &library;
                        // SAFETY: the library stays mapped while this handler
                        // holds a reference to it.
                        unsafe { func() }
                    }),
                );
            }
        }

        debug!(plugin = name, handlers = handlers.len(), "Resolved plugin symbols");
        Ok(handlers)
    }
}

/// Loads plugins from handler sets registered in-process.
#[derive(Debug, Default, Clone)]
pub struct StaticLoader {
    modules: HashMap<String, HandlerSet>,
}

impl StaticLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register module `name`.
    pub fn register(mut self, name: impl Into<String>, handlers: HandlerSet) -> Self {
        self.modules.insert(name.into(), handlers);
        self
    }
}

impl ModuleLoader for StaticLoader {
    fn load(&self, name: &str, path: &Path) -> Result<HandlerSet, LoadError> {
        self.modules
            .get(name)
            .cloned()
            .ok_or_else(|| LoadError::NotFound(path.to_path_buf()))
    }
}

/// A loaded plugin with its resolved handlers.
#[derive(Debug)]
pub struct PluginModule {
    name: String,
    path: PathBuf,
    handlers: HandlerSet,
}

impl PluginModule {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Handler for `action`, if the module provides one.
    pub fn handler(&self, action: Action) -> Option<&Handler> {
        self.handlers.get(action)
    }
}

/// Maps plugin identifiers to loaded modules.
///
/// With retention enabled a module is loaded once and stays resident until
/// [`unload`](Self::unload) or [`unload_all`](Self::unload_all). Without it,
/// every resolve loads a fresh module that is released when the caller drops
/// it.
pub struct PluginRegistry {
    dir: PathBuf,
    loader: Box<dyn ModuleLoader>,
    retain: bool,
    modules: Mutex<HashMap<String, Arc<PluginModule>>>,
}

impl PluginRegistry {
    pub fn new(dir: impl Into<PathBuf>, loader: Box<dyn ModuleLoader>, retain: bool) -> Self {
        Self {
            dir: dir.into(),
            loader,
            retain,
            modules: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn retains_modules(&self) -> bool {
        self.retain
    }

    /// Path a plugin named `name` is loaded from.
    pub fn plugin_path(&self, name: &str) -> PathBuf {
        self.dir
            .join(format!("lib{}.{}", name, std::env::consts::DLL_EXTENSION))
    }

    /// Get the module for `name`, loading it if needed.
    pub fn resolve(&self, name: &str) -> Result<Arc<PluginModule>, LoadError> {
        let mut modules = self.modules();
        if let Some(module) = modules.get(name) {
            return Ok(Arc::clone(module));
        }

        let path = self.plugin_path(name);
        let handlers = self.loader.load(name, &path)?;
        let module = Arc::new(PluginModule {
            name: name.to_string(),
            path,
            handlers,
        });
        info!(
            plugin = name,
            path = %module.path.display(),
            retained = self.retain,
            "Plugin loaded"
        );

        if self.retain {
            modules.insert(name.to_string(), Arc::clone(&module));
        }
        Ok(module)
    }

    /// Drop the cached module `name`. Returns whether it was loaded.
    pub fn unload(&self, name: &str) -> bool {
        let removed = self.modules().remove(name).is_some();
        if removed {
            info!(plugin = name, "Plugin unloaded");
        }
        removed
    }

    /// Drop every cached module. Returns how many were loaded.
    pub fn unload_all(&self) -> usize {
        let drained: Vec<_> = self.modules().drain().collect();
        if !drained.is_empty() {
            info!(count = drained.len(), "Plugins unloaded");
        }
        drained.len()
    }

    /// Names of the cached modules, sorted.
    pub fn loaded(&self) -> Vec<String> {
        let mut names: Vec<_> = self.modules().keys().cloned().collect();
        names.sort();
        names
    }

    fn modules(&self) -> MutexGuard<'_, HashMap<String, Arc<PluginModule>>> {
        self.modules.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
