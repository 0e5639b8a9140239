//! Block lifecycle, naming and super block behavior.

use quickstream_core::{
    BlockModule, DeclareContext, DeclareStatus, ModuleOptions, QsError, Result, Runtime,
    RuntimeConfig, Value,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

struct Inert;

impl BlockModule for Inert {
    fn declare(&mut self, ctx: &mut DeclareContext<'_>) -> Result<DeclareStatus> {
        ctx.add_input("in")?;
        ctx.add_output("out")?;
        Ok(DeclareStatus::Keep)
    }
}

struct Gauged;

impl BlockModule for Gauged {
    fn declare(&mut self, ctx: &mut DeclareContext<'_>) -> Result<DeclareStatus> {
        ctx.add_input("in")?;
        ctx.add_setter("limit", "upper bound")?;
        ctx.add_getter("seen", "packets seen")?;
        ctx.add_constant("flavor", Value::string("plain"))?;
        Ok(DeclareStatus::Keep)
    }
}

struct Faulty;

impl BlockModule for Faulty {
    fn declare(&mut self, _ctx: &mut DeclareContext<'_>) -> Result<DeclareStatus> {
        Err(QsError::module("refusing to exist"))
    }
}

struct Duo;

impl BlockModule for Duo {
    fn options(&self) -> ModuleOptions {
        ModuleOptions {
            is_super: true,
            allow_shared_state: false,
        }
    }

    fn declare(&mut self, ctx: &mut DeclareContext<'_>) -> Result<DeclareStatus> {
        ctx.graph().create_block(None, "inert", Some("first"))?;
        ctx.graph().create_block(None, "inert", Some("second"))?;
        Ok(DeclareStatus::Keep)
    }
}

fn runtime() -> Runtime {
    let rt = Runtime::with_config(RuntimeConfig::default());
    rt.register_builtin("inert", || Box::new(Inert)).unwrap();
    rt.register_builtin("gauged", || Box::new(Gauged)).unwrap();
    rt.register_builtin("faulty", || Box::new(Faulty)).unwrap();
    rt.register_builtin("duo", || Box::new(Duo)).unwrap();
    rt
}

#[test]
fn explicit_names_must_be_unique() {
    let rt = runtime();
    let graph = rt.create_graph(None);
    graph.create_block(None, "inert", Some("worker")).unwrap();
    let err = graph
        .create_block(None, "inert", Some("worker"))
        .unwrap_err();
    assert_eq!(err.code(), "E201");
}

#[test]
fn top_level_names_are_unique_across_graphs() {
    let rt = runtime();
    let a = rt.create_graph(None);
    let b = rt.create_graph(None);
    a.create_block(None, "inert", Some("shared")).unwrap();
    let err = b.create_block(None, "inert", Some("shared")).unwrap_err();
    assert_eq!(err.code(), "E201");
    // The runtime-wide flat lookup resolves the one that exists.
    assert!(rt.find_block("shared").is_some());
}

#[test]
fn auto_names_derive_from_the_module() {
    let rt = runtime();
    let graph = rt.create_graph(None);
    let first = graph.create_block(None, "inert", None).unwrap().unwrap();
    let second = graph.create_block(None, "inert", None).unwrap().unwrap();
    assert_eq!(first.name(), "inert");
    assert_eq!(second.name(), "inert_2");
    assert!(graph.find_block("inert_2").is_some());
}

#[test]
fn declare_failure_rolls_back_cleanly() {
    let rt = runtime();
    let graph = rt.create_graph(None);
    let err = graph
        .create_block(None, "faulty", Some("doomed"))
        .unwrap_err();
    assert_eq!(err.code(), "E204");
    assert!(err.to_string().contains("refusing to exist"));
    assert!(graph.find_block("doomed").is_none());
    // The name is free again.
    graph.create_block(None, "inert", Some("doomed")).unwrap();
}

#[test]
fn declare_unload_is_success_without_a_block() {
    let undeclared = Arc::new(AtomicBool::new(false));
    let destroyed = Arc::new(AtomicBool::new(false));

    struct Ephemeral {
        undeclared: Arc<AtomicBool>,
        destroyed: Arc<AtomicBool>,
    }

    impl BlockModule for Ephemeral {
        fn declare(&mut self, _ctx: &mut DeclareContext<'_>) -> Result<DeclareStatus> {
            Ok(DeclareStatus::Unload)
        }

        fn undeclare(&mut self) {
            self.undeclared.store(true, Ordering::SeqCst);
        }

        fn destroy(&mut self) {
            self.destroyed.store(true, Ordering::SeqCst);
        }
    }

    let rt = runtime();
    let (u, d) = (Arc::clone(&undeclared), Arc::clone(&destroyed));
    rt.register_builtin("ephemeral", move || {
        Box::new(Ephemeral {
            undeclared: Arc::clone(&u),
            destroyed: Arc::clone(&d),
        })
    })
    .unwrap();

    let graph = rt.create_graph(None);
    let block = graph.create_block(None, "ephemeral", Some("gone")).unwrap();
    assert!(block.is_none());
    assert!(graph.find_block("gone").is_none());
    assert!(undeclared.load(Ordering::SeqCst));
    assert!(destroyed.load(Ordering::SeqCst));
}

#[test]
fn super_blocks_own_their_children() {
    let rt = runtime();
    let graph = rt.create_graph(None);
    let duo = graph.create_block(None, "duo", Some("pair")).unwrap().unwrap();
    assert!(duo.is_super());
    let children = duo.children();
    assert_eq!(children.len(), 2);
    assert_eq!(children[0].name(), "pair:first");
    assert_eq!(children[1].name(), "pair:second");
    assert!(graph.find_block("pair:first").is_some());

    // Destroying the super takes the children with it.
    graph.destroy_block(&duo).unwrap();
    assert!(graph.find_block("pair").is_none());
    assert!(graph.find_block("pair:first").is_none());
    assert!(graph.find_block("pair:second").is_none());
}

#[test]
fn children_need_explicit_names() {
    struct Sloppy;

    impl BlockModule for Sloppy {
        fn options(&self) -> ModuleOptions {
            ModuleOptions {
                is_super: true,
                allow_shared_state: false,
            }
        }

        fn declare(&mut self, ctx: &mut DeclareContext<'_>) -> Result<DeclareStatus> {
            ctx.graph().create_block(None, "inert", None)?;
            Ok(DeclareStatus::Keep)
        }
    }

    let rt = runtime();
    rt.register_builtin("sloppy", || Box::new(Sloppy)).unwrap();
    let graph = rt.create_graph(None);
    let err = graph.create_block(None, "sloppy", None).unwrap_err();
    assert_eq!(err.code(), "E204");
    assert!(err.to_string().contains("E207"));
}

#[test]
fn super_loading_its_own_module_is_refused() {
    struct Ouroboros;

    impl BlockModule for Ouroboros {
        fn options(&self) -> ModuleOptions {
            ModuleOptions {
                is_super: true,
                allow_shared_state: false,
            }
        }

        fn declare(&mut self, ctx: &mut DeclareContext<'_>) -> Result<DeclareStatus> {
            ctx.graph().create_block(None, "ouroboros", Some("inner"))?;
            Ok(DeclareStatus::Keep)
        }
    }

    let rt = runtime();
    rt.register_builtin("ouroboros", || Box::new(Ouroboros))
        .unwrap();
    let graph = rt.create_graph(None);
    let err = graph.create_block(None, "ouroboros", None).unwrap_err();
    assert_eq!(err.code(), "E204");
    assert!(err.to_string().contains("E203"));
}

#[test]
fn structural_calls_require_the_creating_thread() {
    let rt = runtime();
    let graph = rt.create_graph(None);
    let joined = std::thread::scope(|s| {
        s.spawn(|| graph.create_block(None, "inert", None)).join()
    });
    assert!(joined.is_err());
}

#[test]
fn missing_module_is_reported() {
    let rt = runtime();
    let graph = rt.create_graph(None);
    let err = graph.create_block(None, "no_such_module", None).unwrap_err();
    assert_eq!(err.code(), "E101");
}

#[test]
fn destroying_twice_is_harmless() {
    let rt = runtime();
    let graph = rt.create_graph(None);
    let block = graph.create_block(None, "inert", None).unwrap().unwrap();
    graph.destroy_block(&block).unwrap();
    graph.destroy_block(&block).unwrap();
    assert!(graph.find_block("inert").is_none());
    // The name can be reused.
    graph.create_block(None, "inert", Some("inert")).unwrap();
}

#[test]
fn shared_memory_attaches_and_frees() {
    let rt = runtime();
    let graph = rt.create_graph(None);
    let (first, allocated) = graph.get_memory("table", 64).unwrap();
    assert!(allocated);
    assert_eq!(first.size(), 64);
    first.lock()[0] = 9;

    let (second, allocated) = graph.get_memory("table", 128).unwrap();
    assert!(!allocated);
    // Attached to the existing segment, whatever size was asked.
    assert_eq!(second.size(), 64);
    assert_eq!(second.lock()[0], 9);

    graph.free_memory("table").unwrap();
    assert_eq!(graph.free_memory("table").unwrap_err().code(), "E501");
    // Handles outlive the name.
    assert_eq!(first.lock()[0], 9);
    // The freed name can be reallocated.
    let (_, allocated) = graph.get_memory("table", 16).unwrap();
    assert!(allocated);
}

#[test]
fn dump_names_the_structure() {
    let rt = runtime();
    let graph = rt.create_graph(Some("printable"));
    let a = graph.create_block(None, "inert", Some("alpha")).unwrap().unwrap();
    let b = graph.create_block(None, "gauged", Some("beta")).unwrap().unwrap();
    graph.connect(&a, "out", &b, "in").unwrap();

    let mut rendered = String::new();
    graph.dump(&mut rendered).unwrap();
    assert!(rendered.contains("printable"));
    assert!(rendered.contains("alpha"));
    assert!(rendered.contains("'out' -> beta"));
    assert!(rendered.contains("'in' <- 'alpha'"));
    assert!(rendered.contains("pool* 'default'"));
    assert!(rendered.contains("set 'limit'"));
    assert!(rendered.contains("get 'seen'"));
    assert!(rendered.contains("const 'flavor' = \"plain\""));
}
