//! Checkpoint session and the host-facing plugin surface.
//!
//! A [`Session`] carries everything that must survive between host
//! callbacks: both topologies, both id maps and the relocation table.
//! [`Checkpointer`] owns one and implements [`CheckpointPlugin`] on top of a
//! [`Platform`] and a [`Host`].

use crate::collector::DeviceStateCollector;
use crate::config::GpuCrConfig;
use crate::device::{DeviceFile, KfdDevice, Platform};
use crate::error::{GpuCrError, Result};
use crate::host::Host;
use crate::identity::GpuIdMap;
use crate::image::{ImageKind, decode_image, encode_image};
use crate::installer::DeviceStateInstaller;
use crate::records::{KfdImage, RenderNodeRecord, topology_from_records};
use crate::relocation::VmaRelocationTable;
use crate::topology::{Topology, TopologyNode};
use crate::types::Pid;

/// Callbacks a checkpoint/restore host drives.
pub trait CheckpointPlugin {
    type Handle;

    /// Save the device file behind `handle` as image `id`.
    fn dump(&mut self, handle: &Self::Handle, id: u32) -> Result<()>;

    /// Re-create the device file saved as image `id`.
    fn restore(&mut self, id: u32) -> Result<Self::Handle>;

    /// New `(path, offset)` for a stale device-file mapping, if it moved.
    fn relocate(&self, path: &str, addr: u64, old_offset: u64) -> Option<(String, u64)>;

    /// Restart a restored process once the host has finished with it.
    fn late_resume(&self, pid: Pid) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct Session {
    /// Checkpoint host. Local at dump time, rebuilt from the image at
    /// restore time.
    src_topology: Option<Topology>,
    /// Restore host.
    dest_topology: Option<Topology>,
    /// actual → user, filled by dump.
    checkpoint_map: GpuIdMap,
    /// user → actual, filled by restore.
    restore_map: GpuIdMap,
    relocations: VmaRelocationTable,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn src_topology(&self) -> Option<&Topology> {
        self.src_topology.as_ref()
    }

    pub fn dest_topology(&self) -> Option<&Topology> {
        self.dest_topology.as_ref()
    }

    pub fn checkpoint_map(&self) -> &GpuIdMap {
        &self.checkpoint_map
    }

    pub fn restore_map(&self) -> &GpuIdMap {
        &self.restore_map
    }

    pub fn relocations(&self) -> &VmaRelocationTable {
        &self.relocations
    }
}

pub struct Checkpointer<P: Platform, H: Host> {
    platform: P,
    host: H,
    config: GpuCrConfig,
    session: Session,
}

impl<P: Platform, H: Host> Checkpointer<P, H> {
    pub fn new(platform: P, host: H, config: GpuCrConfig) -> Self {
        Self {
            platform,
            host,
            config,
            session: Session::new(),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn config(&self) -> &GpuCrConfig {
        &self.config
    }

    fn dump_kfd(&mut self, handle: &P::Handle, id: u32) -> Result<()> {
        let topology =
            cached_topology(&self.platform, &mut self.session.src_topology, "checkpoint")?;
        let kfd = self.platform.attach_kfd(handle)?;
        let platform = &self.platform;
        let open = |node: &TopologyNode| platform.open_render_node(node);

        let mut collector =
            DeviceStateCollector::new(&kfd, topology, &self.config, &self.host, &open);
        collector.dump(id, &mut self.session.checkpoint_map)?;
        Ok(())
    }

    fn dump_render_node(&mut self, minor: u32, id: u32) -> Result<()> {
        let topology =
            cached_topology(&self.platform, &mut self.session.src_topology, "checkpoint")?;
        let node = topology
            .by_render_minor(minor)
            .ok_or_else(|| GpuCrError::mapping(format!("no gpu with render minor {minor}")))?;
        let gpu_id = self.session.checkpoint_map.dest(node.gpu_id).ok_or_else(|| {
            GpuCrError::mapping(format!(
                "renderD{minor} (gpu 0x{:04x}) dumped before any kfd handle",
                node.gpu_id
            ))
        })?;

        let bytes = encode_image(&RenderNodeRecord { gpu_id })?;
        self.host.write_image(&RenderNodeRecord::file_name(id), &bytes)?;
        tracing::info!(id, minor, gpu_id = format_args!("0x{gpu_id:04x}"), "dumped render node");
        Ok(())
    }

    fn restore_kfd(&mut self, bytes: &[u8], id: u32) -> Result<P::Handle> {
        let image: KfdImage = decode_image(bytes)?;
        let src = topology_from_records("checkpoint", &image.devices)?;
        let dest = self.platform.local_topology("local")?;
        let kfd = self.platform.open_kfd()?;

        let platform = &self.platform;
        let open = |node: &TopologyNode| platform.open_render_node(node);
        let mut installer =
            DeviceStateInstaller::new(&kfd, &src, &dest, &self.config, &self.host, &open);
        installer.restore(
            image,
            &mut self.session.restore_map,
            &mut self.session.relocations,
        )?;

        self.session.src_topology = Some(src);
        self.session.dest_topology = Some(dest);
        tracing::info!(id, gpus = self.session.restore_map.len(), "restored kfd state");
        Ok(self.platform.into_handle(kfd))
    }

    /// Render nodes only carry a gpu id, so the kfd image of the same process
    /// must have been restored first.
    fn restore_render_node(&mut self, id: u32) -> Result<P::Handle> {
        let name = RenderNodeRecord::file_name(id);
        let bytes = self.host.read_image(&name)?.ok_or_else(|| GpuCrError::ImageIo {
            name,
            source: std::io::ErrorKind::NotFound.into(),
        })?;
        let record: RenderNodeRecord = decode_image(&bytes)?;

        let actual = self.session.restore_map.dest(record.gpu_id).ok_or_else(|| {
            GpuCrError::mapping(format!(
                "render node gpu 0x{:04x} restored before any kfd handle",
                record.gpu_id
            ))
        })?;
        let node = self
            .session
            .dest_topology
            .as_ref()
            .and_then(|t| t.by_gpu_id(actual))
            .ok_or(GpuCrError::UnmappedGpu { gpu_id: actual })?;

        let handle = self.platform.open_render_handle(node)?;
        tracing::info!(
            id,
            gpu_id = format_args!("0x{actual:04x}"),
            minor = node.gpu.drm_render_minor,
            "restored render node"
        );
        Ok(handle)
    }
}

/// Parse the local topology once per session.
fn cached_topology<'s, P: Platform>(
    platform: &P,
    slot: &'s mut Option<Topology>,
    label: &'static str,
) -> Result<&'s Topology> {
    if slot.is_none() {
        *slot = Some(platform.local_topology(label)?);
    }
    slot.as_ref().ok_or_else(|| GpuCrError::Topology {
        reason: format!("{label}: topology unavailable"),
    })
}

impl<P: Platform, H: Host> CheckpointPlugin for Checkpointer<P, H> {
    type Handle = P::Handle;

    fn dump(&mut self, handle: &P::Handle, id: u32) -> Result<()> {
        match self.platform.classify(handle)? {
            DeviceFile::Kfd => self.dump_kfd(handle, id),
            DeviceFile::RenderNode { minor } => self.dump_render_node(minor, id),
        }
    }

    fn restore(&mut self, id: u32) -> Result<P::Handle> {
        match self.host.read_image(&KfdImage::file_name(id))? {
            Some(bytes) => self.restore_kfd(&bytes, id),
            None => self.restore_render_node(id),
        }
    }

    fn relocate(&self, path: &str, addr: u64, old_offset: u64) -> Option<(String, u64)> {
        self.session.relocations.relocate(path, addr, old_offset)
    }

    fn late_resume(&self, pid: Pid) -> Result<()> {
        let kfd = self.platform.open_kfd()?;
        kfd.resume(pid)?;
        tracing::info!(pid, "resumed process");
        Ok(())
    }
}
