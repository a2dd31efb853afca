use chrono::{Duration, Utc};
use fsctx_core::{EngineConfig, EntryListIterator, FsError};
use fsctx_ops::{
    ErrorDecision, ErrorRequest, FixedMemory, FsContext, FsPolicy, InteractionDecision,
    InteractionRequest, PresetPolicy, TrashBin, TrashRecord,
};
use parking_lot::Mutex;
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

fn trash_config(base: &Path) -> EngineConfig {
    EngineConfig {
        trash_dirs: vec![base.join("trash")],
        discover_volume_trash: false,
        ..Default::default()
    }
}

fn context(policy: Arc<dyn FsPolicy>, config: EngineConfig) -> FsContext {
    FsContext::with_memory_probe(policy, config, Arc::new(FixedMemory(1 << 30))).unwrap()
}

/// Tries to empty the trash again from inside a running emptying.
struct Reentrant {
    config: EngineConfig,
    nested: Mutex<Option<Result<usize, String>>>,
}

impl FsPolicy for Reentrant {
    fn error_handler(&self, request: &ErrorRequest<'_>) -> ErrorDecision {
        PresetPolicy::new().error_handler(request)
    }

    fn interaction(&self, request: &InteractionRequest<'_>) -> InteractionDecision {
        PresetPolicy::new().interaction(request)
    }

    fn about_to_delete_or_trash(&self, _entry: &Path) {
        let mut nested = self.nested.lock();
        if nested.is_some() {
            return;
        }
        let mut ctx = context(Arc::new(PresetPolicy::new()), self.config.clone());
        *nested = Some(match ctx.empty_trash() {
            Ok(report) => Ok(report.succeeded),
            Err(FsError::AlreadyRunning { operation }) => Err(operation),
            Err(other) => panic!("unexpected error {other}"),
        });
    }
}

#[test]
fn test_empty_trash_runs_once_at_a_time() {
    let temp = TempDir::new().unwrap();
    let base = temp.path().canonicalize().unwrap();
    let config = trash_config(&base);
    fs::create_dir_all(base.join("docs/old")).unwrap();
    fs::write(base.join("docs/a.txt"), b"a").unwrap();
    fs::write(base.join("docs/old/b.txt"), b"b").unwrap();

    let mut ctx = context(Arc::new(PresetPolicy::new()), config.clone());
    let mut entries =
        EntryListIterator::from_paths([base.join("docs/a.txt"), base.join("docs/old")]).unwrap();
    ctx.move_to_trash(&mut entries).unwrap();
    assert_eq!(ctx.trash_contents().unwrap().len(), 2);

    let policy = Arc::new(Reentrant {
        config: config.clone(),
        nested: Mutex::new(None),
    });
    let mut ctx = context(policy.clone(), config);
    let report = ctx.empty_trash().unwrap();

    assert_eq!(report.succeeded, 2);
    assert!(ctx.trash_contents().unwrap().is_empty());
    assert_eq!(
        policy.nested.lock().clone(),
        Some(Err("Emptying trash".to_string()))
    );
    let info: Vec<_> = fs::read_dir(base.join("trash/info")).unwrap().collect();
    assert!(info.is_empty());
}

#[test]
fn test_reclaim_removes_oldest_first() {
    let temp = TempDir::new().unwrap();
    let base = temp.path().canonicalize().unwrap();
    let bin = TrashBin::open(&base.join("trash")).unwrap();
    for (name, age) in [("newest", 10), ("oldest", 3000), ("middle", 200)] {
        fs::write(bin.files_dir().join(name), vec![0u8; 100]).unwrap();
        let record = TrashRecord {
            original_path: PathBuf::from("/home/user").join(name),
            trashed_at: Utc::now() - Duration::seconds(age),
        };
        record.store_sidecar(&bin.sidecar(OsStr::new(name))).unwrap();
    }

    let mut ctx = context(Arc::new(PresetPolicy::new()), trash_config(&base));
    let report = ctx.reclaim_trash_space(bin.device(), 150).unwrap();

    assert_eq!(report.succeeded, 2);
    let left: Vec<_> = ctx
        .trash_contents()
        .unwrap()
        .into_iter()
        .map(|entry| entry.path.file_name().unwrap().to_owned())
        .collect();
    assert_eq!(left, ["newest"]);
    assert!(!bin.sidecar(OsStr::new("oldest")).exists());
    assert!(bin.sidecar(OsStr::new("newest")).exists());
}
