//! Dynamic block module loading with copy-isolation.
//!
//! A module name resolves to a shared object on the block search path or,
//! failing that, to a registered builtin. Loading the same shared object a
//! second time is where it gets interesting: `dlopen` hands back the
//! *same* mapping, so two blocks would silently share every global in the
//! module. Unless the module opts in via
//! [`allow_shared_state`](super::ModuleOptions::allow_shared_state), the
//! loader detects the aliased handle, copies the file to a temporary
//! location and loads the copy, giving each block instance its own
//! globals.

use super::registry::BuiltinRegistry;
use super::{BlockModule, ENTRY_SYMBOL};
use crate::config::RuntimeConfig;
use crate::dict::Dict;
use crate::error::{QsError, Result};
use libloading::Library;
use parking_lot::Mutex;
use std::os::raw::c_void;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;

#[cfg(target_os = "macos")]
const DSO_SUFFIX: &str = ".dylib";
#[cfg(not(target_os = "macos"))]
const DSO_SUFFIX: &str = ".so";

/// Raw `dlopen` handles of every open module, keyed by canonical path.
/// Shared with every [`ModuleHandle`] so handles can deregister on drop.
pub(crate) type SharedHandles = Arc<Mutex<Dict<Vec<usize>>>>;

type EntryFn = unsafe extern "C" fn() -> *mut c_void;

/// Where a block's module came from. Used for the self-load check on
/// super block chains and for diagnostics.
pub(crate) enum ModuleSource {
    Dynamic {
        path: PathBuf,
        #[allow(dead_code)]
        handle: ModuleHandle,
    },
    Builtin {
        name: String,
    },
}

impl ModuleSource {
    /// Stable identity string: two blocks with equal identities run the
    /// same module code.
    pub(crate) fn identity(&self) -> String {
        match self {
            Self::Dynamic { path, .. } => format!("dso:{}", path.display()),
            Self::Builtin { name } => format!("builtin:{name}"),
        }
    }
}

impl std::fmt::Debug for ModuleSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.identity())
    }
}

/// Keeps a dynamic library mapped for as long as its block lives.
///
/// Dropping the handle deregisters the raw handle from the shared
/// registry, closes the library and deletes the isolation copy if one was
/// made. The owning block must drop its module instance first; code in a
/// closed library must never run.
pub(crate) struct ModuleHandle {
    registry_key: String,
    raw: usize,
    registered: bool,
    shared: SharedHandles,
    // Field order: the library must outlive nothing here, but must itself
    // be unmapped before the temp file backing it is deleted.
    lib: Library,
    _isolation_copy: Option<NamedTempFile>,
}

impl ModuleHandle {
    /// Record this handle in the shared registry so later opens of the
    /// same path are recognized as aliased. Only registered handles
    /// deregister on drop; a transient duplicate that was never
    /// registered must not erase the entry of the handle that was.
    fn register(&mut self) {
        let mut shared = self.shared.lock();
        match shared.find_mut(&self.registry_key) {
            Some(handles) => handles.push(self.raw),
            None => {
                // A path with unprintable bytes cannot be a dictionary
                // key; such a module simply skips deduplication.
                if let Err(err) = shared.insert(&self.registry_key, vec![self.raw]) {
                    tracing::warn!(error = %err, "module path not registrable for deduplication");
                    return;
                }
            }
        }
        self.registered = true;
    }

    /// Resolve the entry symbol and build a fresh module instance.
    fn instantiate(&self) -> Result<Box<dyn BlockModule>> {
        let entry: libloading::Symbol<'_, EntryFn> = unsafe {
            self.lib.get(ENTRY_SYMBOL.as_bytes()).map_err(|e| QsError::ModuleSymbol {
                path: PathBuf::from(&self.registry_key),
                cause: e.to_string(),
            })?
        };
        let raw = unsafe { entry() };
        if raw.is_null() {
            return Err(QsError::module(format!(
                "{ENTRY_SYMBOL} returned a null module"
            )));
        }
        // The entry point double-boxes the trait object so the fat
        // pointer survives the C ABI.
        Ok(unsafe { *Box::from_raw(raw as *mut Box<dyn BlockModule>) })
    }
}

impl Drop for ModuleHandle {
    fn drop(&mut self) {
        if !self.registered {
            return;
        }
        let mut shared = self.shared.lock();
        let mut gone = false;
        if let Some(handles) = shared.find_mut(&self.registry_key) {
            if let Some(at) = handles.iter().position(|h| *h == self.raw) {
                handles.remove(at);
            }
            gone = handles.is_empty();
        }
        if gone {
            shared.remove(&self.registry_key);
        }
    }
}

/// Resolves module names and produces isolated module instances.
pub(crate) struct ModuleLoader {
    block_path: Vec<PathBuf>,
    shared: SharedHandles,
}

impl ModuleLoader {
    pub(crate) fn new(config: &RuntimeConfig, shared: SharedHandles) -> Self {
        Self {
            block_path: config.block_path.clone(),
            shared,
        }
    }

    /// Load the module named `name`.
    ///
    /// Search order: an explicit path as given, then `{name}` and
    /// `lib{name}` with the platform suffix in each configured block
    /// directory, then the installed default directory next to the
    /// executable. A dynamic load failure falls back to the builtin of
    /// the same name before being reported.
    pub(crate) fn load(
        &self,
        name: &str,
        builtins: &Mutex<BuiltinRegistry>,
    ) -> Result<(Box<dyn BlockModule>, ModuleSource)> {
        let dynamic_err = match self.resolve(name) {
            Some(path) => match self.load_dynamic(&path) {
                Ok(loaded) => return Ok(loaded),
                Err(err) => {
                    tracing::warn!(
                        module = name,
                        path = %path.display(),
                        error = %err,
                        "dynamic module load failed, trying builtin"
                    );
                    Some(err)
                }
            },
            None => None,
        };
        if let Some(module) = builtins.lock().instantiate(name) {
            tracing::debug!(module = name, "loaded builtin block module");
            return Ok((
                module,
                ModuleSource::Builtin {
                    name: name.to_string(),
                },
            ));
        }
        Err(dynamic_err.unwrap_or_else(|| QsError::ModuleNotFound {
            name: name.to_string(),
        }))
    }

    fn resolve(&self, name: &str) -> Option<PathBuf> {
        let direct = Path::new(name);
        if name.contains(std::path::MAIN_SEPARATOR) || name.ends_with(DSO_SUFFIX) {
            return direct.is_file().then(|| direct.to_path_buf());
        }
        let candidates = [format!("{name}{DSO_SUFFIX}"), format!("lib{name}{DSO_SUFFIX}")];
        for dir in self.search_dirs() {
            for file in &candidates {
                let path = dir.join(file);
                if path.is_file() {
                    return Some(path);
                }
            }
        }
        None
    }

    fn search_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = self.block_path.clone();
        if let Some(exe_dir) = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
        {
            dirs.push(exe_dir.join("quickstream").join("blocks"));
        }
        dirs
    }

    fn load_dynamic(&self, path: &Path) -> Result<(Box<dyn BlockModule>, ModuleSource)> {
        let canonical = path.canonicalize().map_err(|e| QsError::ModuleIo {
            path: path.to_path_buf(),
            cause: e.to_string(),
        })?;
        let handle = self.open(&canonical, None)?;
        let mut module = handle.instantiate()?;

        let aliased = {
            let shared = self.shared.lock();
            let mut seen = false;
            shared.for_each(|_, handles| {
                if handles.contains(&handle.raw) {
                    seen = true;
                    return std::ops::ControlFlow::Break(());
                }
                std::ops::ControlFlow::Continue(())
            });
            handle.raw != 0 && seen
        };

        let mut handle = if aliased && !module.options().allow_shared_state {
            tracing::debug!(
                path = %canonical.display(),
                "module already mapped, loading an isolated copy"
            );
            // The instance from the aliased mapping must die before the
            // mapping is released.
            drop(module);
            drop(handle);
            let copy = tempfile::Builder::new()
                .prefix("qs-block-")
                .suffix(DSO_SUFFIX)
                .tempfile()
                .and_then(|tmp| std::fs::copy(&canonical, tmp.path()).map(|_| tmp))
                .map_err(|e| QsError::ModuleIo {
                    path: canonical.clone(),
                    cause: e.to_string(),
                })?;
            let copy_path = copy.path().to_path_buf();
            let isolated = self.open(&copy_path, Some(copy))?;
            module = isolated.instantiate()?;
            isolated
        } else {
            handle
        };

        handle.register();

        tracing::info!(path = %canonical.display(), "loaded dynamic block module");
        Ok((
            module,
            ModuleSource::Dynamic {
                path: canonical,
                handle,
            },
        ))
    }

    fn open(&self, path: &Path, isolation_copy: Option<NamedTempFile>) -> Result<ModuleHandle> {
        let (lib, raw) = open_with_raw(path)?;
        Ok(ModuleHandle {
            registry_key: path.to_string_lossy().into_owned(),
            raw,
            registered: false,
            shared: Arc::clone(&self.shared),
            lib,
            _isolation_copy: isolation_copy,
        })
    }
}

/// Open a library and report its raw `dlopen` handle for alias detection.
#[cfg(unix)]
fn open_with_raw(path: &Path) -> Result<(Library, usize)> {
    use libloading::os::unix;
    let lib = unsafe { unix::Library::new(path) }.map_err(|e| QsError::ModuleOpen {
        path: path.to_path_buf(),
        cause: e.to_string(),
    })?;
    let raw = lib.into_raw() as usize;
    // Round-trip: the Library regains ownership of the handle it just
    // exposed.
    let lib = unsafe { unix::Library::from_raw(raw as *mut c_void) };
    Ok((Library::from(lib), raw))
}

/// Non-unix platforms get no alias detection; every load is treated as
/// fresh.
#[cfg(not(unix))]
fn open_with_raw(path: &Path) -> Result<(Library, usize)> {
    let lib = unsafe { Library::new(path) }.map_err(|e| QsError::ModuleOpen {
        path: path.to_path_buf(),
        cause: e.to_string(),
    })?;
    Ok((lib, 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loader() -> ModuleLoader {
        let config = RuntimeConfig::default();
        ModuleLoader::new(&config, Arc::new(Mutex::new(Dict::new())))
    }

    #[test]
    fn missing_module_resolves_to_none() {
        assert!(loader().resolve("definitely_not_a_module").is_none());
    }

    #[test]
    fn load_of_unknown_name_reports_not_found() {
        let builtins = Mutex::new(BuiltinRegistry::new());
        let Err(err) = loader().load("ghost", &builtins) else {
            panic!("unknown module name produced a module");
        };
        assert_eq!(err.code(), "E101");
    }

    /// Compile a tiny cdylib to dlopen against.
    #[cfg(unix)]
    fn fixture_library(dir: &Path) -> PathBuf {
        let src = dir.join("fixture.rs");
        std::fs::write(
            &src,
            "#[no_mangle]\npub extern \"C\" fn fixture_value() -> u32 { 7 }\n",
        )
        .unwrap();
        let out = dir.join("libfixture.so");
        let status = std::process::Command::new("rustc")
            .args(["--crate-type=cdylib", "-o"])
            .arg(&out)
            .arg(&src)
            .status()
            .unwrap();
        assert!(status.success(), "fixture library failed to compile");
        out
    }

    #[test]
    #[cfg(unix)]
    fn dlopen_aliases_the_same_file_but_not_a_copy() {
        let dir = tempfile::tempdir().unwrap();
        let out = fixture_library(dir.path());

        // Two opens of the same file share one mapping; this is the
        // aliasing the isolation copy defends against.
        let (_lib_a, raw_a) = open_with_raw(&out).unwrap();
        let (_lib_b, raw_b) = open_with_raw(&out).unwrap();
        assert_ne!(raw_a, 0);
        assert_eq!(raw_a, raw_b);

        let copy = dir.path().join("libfixture_copy.so");
        std::fs::copy(&out, &copy).unwrap();
        let (lib_c, raw_c) = open_with_raw(&copy).unwrap();
        assert_ne!(raw_a, raw_c);
        unsafe {
            let f: libloading::Symbol<'_, unsafe extern "C" fn() -> u32> =
                lib_c.get(b"fixture_value").unwrap();
            assert_eq!(f(), 7);
        }

        // Registered handles deregister themselves from the shared
        // registry.
        let shared: SharedHandles = Arc::new(Mutex::new(Dict::new()));
        let loader = ModuleLoader {
            block_path: Vec::new(),
            shared: Arc::clone(&shared),
        };
        let mut handle = loader.open(&out, None).unwrap();
        handle.register();
        let key = handle.registry_key.clone();
        assert!(shared.lock().find(&key).is_some());
        drop(handle);
        assert!(shared.lock().find(&key).is_none());
    }

    #[test]
    #[cfg(unix)]
    fn discarded_duplicate_handle_keeps_the_registration_alive() {
        use std::ops::ControlFlow;

        let dir = tempfile::tempdir().unwrap();
        let out = fixture_library(dir.path());
        let shared: SharedHandles = Arc::new(Mutex::new(Dict::new()));
        let loader = ModuleLoader {
            block_path: Vec::new(),
            shared: Arc::clone(&shared),
        };

        let mut first = loader.open(&out, None).unwrap();
        first.register();
        let key = first.registry_key.clone();

        // A second open of the same file aliases the first mapping and is
        // discarded before the isolation copy takes its place. Dropping
        // it must not evict the first handle's registration.
        let second = loader.open(&out, None).unwrap();
        assert_eq!(second.raw, first.raw);
        drop(second);
        assert_eq!(shared.lock().find(&key), Some(&vec![first.raw]));

        // So a third open of the path is still seen as aliased.
        let third = loader.open(&out, None).unwrap();
        let mut seen = false;
        shared.lock().for_each(|_, handles| {
            if handles.contains(&third.raw) {
                seen = true;
                return ControlFlow::Break(());
            }
            ControlFlow::Continue(())
        });
        assert!(seen, "third open of one path went undetected as aliased");
        drop(third);
        drop(first);
        assert!(shared.lock().find(&key).is_none());
    }

    #[test]
    fn builtin_fallback_wins_when_no_file_exists() {
        use crate::module::{DeclareContext, DeclareStatus};

        struct Stub;
        impl BlockModule for Stub {
            fn declare(&mut self, _ctx: &mut DeclareContext<'_>) -> Result<DeclareStatus> {
                Ok(DeclareStatus::Keep)
            }
        }

        let mut registry = BuiltinRegistry::new();
        registry.register("stub", Arc::new(|| Box::new(Stub))).unwrap();
        let builtins = Mutex::new(registry);
        let (_, source) = loader().load("stub", &builtins).unwrap();
        assert_eq!(source.identity(), "builtin:stub");
    }
}
