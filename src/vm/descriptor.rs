//! libvirt domain XML for an application VM.
//!
//! The domain boots the NixOS system closure directly (kernel, initrd, init
//! from the store), mounts `/nix/store` read-only over 9p, exposes the
//! per-application shared directory as the `shared` 9p tag, and attaches the
//! backing disk through QEMU `-snapshot` so the base image is never written.
//!
//! ```text
//! DomainDescriptor ──► to_domain_xml() ──► Hypervisor::create (VALIDATE)
//! ```

use std::path::Path;

use crate::vm::DomainDescriptor;

/// Maximum memory the balloon can grow to.
pub const MAX_MEMORY_GIB: u32 = 2;
/// Memory at boot, before autoballoon adjusts it.
pub const BOOT_MEMORY_GIB: u32 = 1;
pub const VCPUS: u32 = 4;

/// Render the descriptor as a transient libvirt domain definition.
pub fn to_domain_xml(desc: &DomainDescriptor) -> String {
    let system = desc.system_image.display().to_string();
    format!(
        r#"<domain type='kvm' xmlns:qemu='http://libvirt.org/schemas/domain/qemu/1.0'>
  <name>{name}</name>
  <memory unit='GiB'>{max_mem}</memory>
  <currentMemory unit='GiB'>{boot_mem}</currentMemory>
  <vcpu>{vcpus}</vcpu>
  <os>
    <type arch='x86_64'>hvm</type>
    <kernel>{kernel}</kernel>
    <initrd>{initrd}</initrd>
    <cmdline>loglevel=4 init={init} {reg_info}</cmdline>
  </os>
  <features>
    <acpi/>
  </features>
  <cpu mode='host-passthrough'/>
  <clock offset='utc'/>
  <on_poweroff>destroy</on_poweroff>
  <on_reboot>restart</on_reboot>
  <on_crash>destroy</on_crash>
  <devices>
    <graphics type='spice' autoport='yes'>
      <listen type='address'/>
      <image compression='off'/>
    </graphics>
    <channel type='spicevmc'>
      <target type='virtio' name='com.redhat.spice.0'/>
    </channel>
    <video>
      <model type='qxl'/>
    </video>
    <sound model='ich6'/>
    <interface type='network'>
      <source network='default'/>
    </interface>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='{disk}'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    <filesystem type='mount' accessmode='passthrough'>
      <source dir='/nix/store'/>
      <target dir='nix-store'/>
      <readonly/>
    </filesystem>
    <filesystem type='mount' accessmode='mapped'>
      <source dir='{shared}'/>
      <target dir='shared'/>
    </filesystem>
    <memballoon model='virtio'>
      <stats period='1'/>
    </memballoon>
  </devices>
  <qemu:commandline>
    <qemu:arg value='-snapshot'/>
  </qemu:commandline>
</domain>
"#,
        name = escape(&desc.name),
        max_mem = MAX_MEMORY_GIB,
        boot_mem = BOOT_MEMORY_GIB,
        vcpus = VCPUS,
        kernel = escape(&format!("{system}/kernel")),
        initrd = escape(&format!("{system}/initrd")),
        init = escape(&format!("{system}/init")),
        reg_info = escape(&desc.reg_info),
        disk = escape_path(&desc.disk_image),
        shared = escape_path(&desc.shared_dir),
    )
}

fn escape_path(path: &Path) -> String {
    escape(&path.display().to_string())
}

/// Escape text for use in element content and single-quoted attributes.
fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    out
}
