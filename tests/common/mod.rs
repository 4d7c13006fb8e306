//! Shared fixtures: an in-memory hypervisor and stub external tools.
//!
//! The stubs are tiny shell scripts written into a temporary directory and
//! wired in through `Config`, so the real build pipeline runs end to end
//! without Nix, QEMU or libvirt.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;

use appvm::config::Config;
use appvm::error::{AppvmError, Result, VIR_ERR_NO_DOMAIN};
use appvm::hypervisor::{DomainHandle, Hypervisor, MemoryInfo};
use appvm::paths::AppvmPaths;
use appvm::vm::{AppName, DomainDescriptor};

pub const MIB: u64 = 1024 * 1024;
pub const GIB: u64 = 1024 * MIB;

#[derive(Debug, Clone)]
pub struct FakeDomain {
    pub handle: DomainHandle,
    pub max_bytes: u64,
    pub current_bytes: u64,
}

/// Hypervisor double. `shutdown` only records the request; call
/// [`FakeHypervisor::tear_down`] to simulate the guest actually stopping.
#[derive(Debug, Default)]
pub struct FakeHypervisor {
    pub domains: BTreeMap<String, FakeDomain>,
    pub created: Vec<DomainDescriptor>,
    pub shutdowns: Vec<String>,
    pub memory_set: Vec<(String, u64)>,
    next_id: i32,
}

impl FakeHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_domain(mut self, name: &str, max_bytes: u64, current_bytes: u64) -> Self {
        self.insert(name, max_bytes, current_bytes);
        self
    }

    fn insert(&mut self, name: &str, max_bytes: u64, current_bytes: u64) -> DomainHandle {
        self.next_id += 1;
        let handle = DomainHandle {
            name: name.to_string(),
            uuid: [self.next_id as u8; 16],
            id: self.next_id,
        };
        self.domains.insert(
            name.to_string(),
            FakeDomain {
                handle: handle.clone(),
                max_bytes,
                current_bytes,
            },
        );
        handle
    }

    pub fn tear_down(&mut self, name: &str) {
        self.domains.remove(name);
    }

    fn not_found(operation: &'static str, name: &str) -> AppvmError {
        AppvmError::Hypervisor {
            operation,
            code: VIR_ERR_NO_DOMAIN,
            message: format!("Domain not found: no domain with matching name '{name}'"),
        }
    }
}

impl Hypervisor for FakeHypervisor {
    async fn list_domains(&mut self) -> Result<Vec<DomainHandle>> {
        Ok(self.domains.values().map(|d| d.handle.clone()).collect())
    }

    async fn lookup(&mut self, name: &str) -> Result<Option<DomainHandle>> {
        Ok(self.domains.get(name).map(|d| d.handle.clone()))
    }

    async fn create(&mut self, descriptor: &DomainDescriptor) -> Result<DomainHandle> {
        assert!(
            !self.domains.contains_key(&descriptor.name),
            "domain {} created twice",
            descriptor.name
        );
        self.created.push(descriptor.clone());
        Ok(self.insert(&descriptor.name, 2 * GIB, GIB))
    }

    async fn shutdown(&mut self, domain: &DomainHandle) -> Result<()> {
        if !self.domains.contains_key(&domain.name) {
            return Err(Self::not_found("shutdown", &domain.name));
        }
        self.shutdowns.push(domain.name.clone());
        Ok(())
    }

    async fn memory_info(&mut self, domain: &DomainHandle) -> Result<MemoryInfo> {
        let d = self
            .domains
            .get(&domain.name)
            .ok_or_else(|| Self::not_found("get info", &domain.name))?;
        Ok(MemoryInfo {
            state: 1,
            max_bytes: d.max_bytes,
            current_bytes: d.current_bytes,
            vcpus: 4,
            cpu_time_ns: 0,
        })
    }

    async fn set_memory(&mut self, domain: &DomainHandle, bytes: u64) -> Result<()> {
        let d = self
            .domains
            .get_mut(&domain.name)
            .ok_or_else(|| Self::not_found("set memory", &domain.name))?;
        d.current_bytes = bytes;
        self.memory_set.push((domain.name.clone(), bytes));
        Ok(())
    }
}

/// Handle onto one [`FakeHypervisor`] shared by several concurrent sessions.
/// The inner lock is held only for the duration of each call.
#[derive(Debug, Clone, Default)]
pub struct SharedHypervisor(pub Arc<Mutex<FakeHypervisor>>);

impl SharedHypervisor {
    pub fn new(hv: FakeHypervisor) -> Self {
        Self(Arc::new(Mutex::new(hv)))
    }
}

impl Hypervisor for SharedHypervisor {
    async fn list_domains(&mut self) -> Result<Vec<DomainHandle>> {
        self.0.lock().await.list_domains().await
    }

    async fn lookup(&mut self, name: &str) -> Result<Option<DomainHandle>> {
        self.0.lock().await.lookup(name).await
    }

    async fn create(&mut self, descriptor: &DomainDescriptor) -> Result<DomainHandle> {
        self.0.lock().await.create(descriptor).await
    }

    async fn shutdown(&mut self, domain: &DomainHandle) -> Result<()> {
        self.0.lock().await.shutdown(domain).await
    }

    async fn memory_info(&mut self, domain: &DomainHandle) -> Result<MemoryInfo> {
        self.0.lock().await.memory_info(domain).await
    }

    async fn set_memory(&mut self, domain: &DomainHandle, bytes: u64) -> Result<()> {
        self.0.lock().await.set_memory(domain, bytes).await
    }
}

/// Temporary home with state/config roots, one spec search root and stub tools.
pub struct TestEnv {
    pub tmp: tempfile::TempDir,
    pub paths: AppvmPaths,
    pub config: Config,
    pub store: PathBuf,
    pub specs: PathBuf,
}

impl TestEnv {
    pub fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_path_buf();
        let paths = AppvmPaths::from_roots(root.join("appvm"), root.join("config"));
        paths.ensure().unwrap();
        paths.write_templates().unwrap();

        let bin = root.join("bin");
        let store = root.join("store");
        let specs = root.join("specs");
        std::fs::create_dir_all(&bin).unwrap();
        std::fs::create_dir_all(specs.join("nix")).unwrap();

        let config = Config {
            search_paths: vec![specs.clone()],
            builder: script(&bin, "nix-build", &successful_builder(&store)),
            evaluator: script(&bin, "nix", "exit 1"),
            disk_tool: script(&bin, "qemu-img", r#": > "$4""#),
            viewer: "true".to_string(),
            ..Config::default()
        };

        Self {
            tmp,
            paths,
            config,
            store,
            specs,
        }
    }

    pub fn add_spec(&self, name: &str) -> PathBuf {
        let path = self.specs.join("nix").join(format!("{name}.nix"));
        std::fs::write(&path, "{ imports = [ <nix/base.nix> ]; }\n").unwrap();
        path
    }

    /// Replace the builder with a script running `body`.
    pub fn set_builder(&mut self, body: &str) {
        let bin = self.tmp.path().join("bin");
        self.config.builder = script(&bin, "nix-build", body);
    }

    pub fn set_evaluator(&mut self, body: &str) {
        let bin = self.tmp.path().join("bin");
        self.config.evaluator = script(&bin, "nix", body);
    }

    pub fn write_memory_used(&self, app: &str, contents: &str) {
        let name = AppName::new(app).unwrap();
        std::fs::create_dir_all(self.paths.app_dir(&name)).unwrap();
        std::fs::write(self.paths.memory_used_file(&name), contents).unwrap();
    }

    pub fn out_links(&self) -> Vec<PathBuf> {
        std::fs::read_dir(&self.paths.config)
            .unwrap()
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("result"))
            })
            .collect()
    }
}

/// A builder that fakes a NixOS VM build result under `store` and points the
/// `-o` out-link at it.
pub fn successful_builder(store: &Path) -> String {
    builder_with_script(
        store,
        "exec qemu-kvm -append \"init=$SYSTEM/init regInfo=$STORE/closure-info/registration console=ttyS0\"",
    )
}

pub fn builder_with_script(store: &Path, run_script: &str) -> String {
    format!(
        r#"STORE="{store}"
SYSTEM="$STORE/nixos-system"
out=""
while [ $# -gt 0 ]; do
  case "$1" in
    -o) out="$2"; shift 2 ;;
    *) shift ;;
  esac
done
echo "building '$STORE/vm.drv'..."
mkdir -p "$STORE/vm/bin" "$SYSTEM"
cat > "$STORE/vm/bin/run-nixos-vm" <<SCRIPT
#!/bin/sh
{run_script}
SCRIPT
ln -sfn "$SYSTEM" "$STORE/vm/system"
ln -sfn "$STORE/vm" "$out"
"#,
        store = store.display(),
    )
}

fn script(dir: &Path, name: &str, body: &str) -> String {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.to_string_lossy().into_owned()
}
