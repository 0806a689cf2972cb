use crate::vrt_lib::assembly::AssemblyGroup;
use crate::vrt_lib::desc::{kbytes_to_sectors, sectors_to_bytes, NBMAX_VOLUMES_PER_GROUP,
                           SECTOR_SIZE, VRT_DEFAULT_MAX_REQUESTS};
use crate::vrt_lib::error::{VrtError, VrtResult};
use crate::vrt_lib::layout::{IoSubRequest, LayoutInstance, LayoutKind, RwMode};
use crate::vrt_lib::nodeset::ExaNodeset;
use crate::vrt_lib::rain1::Rain1Group;
use crate::vrt_lib::sstriping::SstripingGroup;
use crate::vrt_lib::storage::Storage;
use crate::vrt_lib::stream::{MemoryStream, StreamAccess, StreamExt};
use crate::vrt_lib::superblock::{superblock_format, superblock_read, superblock_write,
                                 SB_AREA_BYTES, SB_AREA_FIRST_SECTOR};
use crate::vrt_lib::uuid::ExaUuid;
use crate::vrt_lib::volume::{VolumeStatus, VrtVolume};
use log::*;
use nbd_driver::NbdDriver;
use std::sync::{Condvar, Mutex};

pub const VRT_GROUP_HEADER_MAGIC: u32 = 0x66052A77;
pub const VRT_GROUP_HEADER_FORMAT: u32 = 1;

/* Layout ids on disk, from the historical layout registry */
const LAYOUT_WIRE_SSTRIPING: u32 = 356;
const LAYOUT_WIRE_RAIN1: u32 = 357;

/// Compound status of a group. Transitions atomically across the whole
/// group on every membership change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStatus {
    Ok,
    Degraded,
    Offline,
}

/// Runtime handle injected into the request entry points. Caps the number
/// of outstanding block requests; submitters block when the cap is reached.
pub struct VrtRuntime {
    max_requests: usize,
    outstanding: Mutex<usize>,
    cond: Condvar,
}

impl Default for VrtRuntime {
    fn default() -> Self {
        Self::new(VRT_DEFAULT_MAX_REQUESTS)
    }
}

impl VrtRuntime {
    pub fn new(max_requests: usize) -> Self {
        assert!(max_requests > 0);
        Self { max_requests, outstanding: Mutex::new(0), cond: Condvar::new() }
    }

    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    fn begin_request(&self) -> RequestGuard<'_> {
        let mut outstanding = self.outstanding.lock().unwrap();
        while *outstanding >= self.max_requests {
            outstanding = self.cond.wait(outstanding).unwrap();
        }
        *outstanding += 1;
        RequestGuard { runtime: self }
    }
}

struct RequestGuard<'a> {
    runtime: &'a VrtRuntime,
}

impl Drop for RequestGuard<'_> {
    fn drop(&mut self) {
        let mut outstanding = self.runtime.outstanding.lock().unwrap();
        *outstanding -= 1;
        self.runtime.cond.notify_one();
    }
}

/// Parameters of a group creation
#[derive(Debug, Clone, Copy)]
pub struct GroupCreateParams {
    pub slot_width: u32,
    /// Chunk size in KiB
    pub chunk_size: u32,
    /// Stripe unit in sectors
    pub su_size: u32,
    /// Dirty zone size in KiB (RAIN-1 only)
    pub dirty_zone_size: u32,
    pub nb_spare: u32,
    pub nb_nodes_in_cluster: u32,
}

/// Read the whole superblock area of a device into memory
pub fn read_sb_area(driver: &mut dyn NbdDriver) -> VrtResult<Vec<u8>> {
    let mut area = vec![0u8; SB_AREA_BYTES as usize];
    driver.nbd_read(SB_AREA_FIRST_SECTOR, &mut area).map_err(|err| {
        error!("superblock area read failed: {}", err);
        VrtError::Io
    })?;
    Ok(area)
}

/// Write a superblock area back to its device
pub fn write_sb_area(driver: &mut dyn NbdDriver, area: &[u8]) -> VrtResult<()> {
    driver.nbd_write(SB_AREA_FIRST_SECTOR, area).map_err(|err| {
        error!("superblock area write failed: {}", err);
        VrtError::Io
    })
}

/// Top container: storage + assembly + layout instance + volumes.
///
/// All admin operations commit the whole group image to every attached
/// rdev superblock; readers pick the highest valid version.
pub struct VrtGroup {
    pub uuid: ExaUuid,
    pub name: String,
    pub status: GroupStatus,
    pub storage: Storage,
    pub assembly: AssemblyGroup,
    pub layout: LayoutInstance,
    pub volumes: Vec<VrtVolume>,
    pub sb_version: u64,
    pub nb_nodes_in_cluster: u32,
    /// Nodes seen up in the last membership update
    nb_nodes_up: u32,
    started: bool,
    /// One device handle per storage rdev, attached as transports resolve
    devices: Vec<Option<Box<dyn NbdDriver>>>,
}

impl VrtGroup {
    pub fn create(name: &str, uuid: ExaUuid, kind: LayoutKind, params: GroupCreateParams,
                  mut storage: Storage) -> VrtResult<Self> {
        if name.is_empty() || uuid.is_zero() {
            return Err(VrtError::InvalidArg);
        }

        storage.cut_in_chunks(params.chunk_size)?;
        let chunk_size_sectors = kbytes_to_sectors(params.chunk_size as u64);

        let (layout, assembly) = match kind {
            LayoutKind::Sstriping => {
                let (ssg, ag) = SstripingGroup::create(&storage, chunk_size_sectors,
                                                       params.su_size)?;
                (LayoutInstance::Sstriping(ssg), ag)
            }
            LayoutKind::Rain1 => {
                let (rxg, ag) = Rain1Group::create(&storage, params.slot_width,
                                                   chunk_size_sectors, params.su_size,
                                                   params.dirty_zone_size, params.nb_spare,
                                                   params.nb_nodes_in_cluster)?;
                (LayoutInstance::Rain1(rxg), ag)
            }
        };

        // Device handles are indexed like the rdev arena
        let nb_rdevs = storage.rdevs.len();
        info!("created group '{}' ({}) with layout {} over {} rdevs",
              name, uuid, kind.name(), nb_rdevs);

        Ok(Self {
            uuid,
            name: name.to_string(),
            status: GroupStatus::Offline,
            storage,
            assembly,
            layout,
            volumes: vec![],
            sb_version: 0,
            nb_nodes_in_cluster: params.nb_nodes_in_cluster,
            nb_nodes_up: params.nb_nodes_in_cluster,
            started: false,
            devices: (0..nb_rdevs).map(|_| None).collect(),
        })
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Attach the opened transport of an rdev. The device comes up.
    pub fn attach_device(&mut self, rdev_uuid: &ExaUuid,
                         mut driver: Box<dyn NbdDriver>) -> VrtResult<()> {
        let idx = self.storage.get_rdev_idx(rdev_uuid).ok_or(VrtError::NotFound)?;

        driver.nbd_open().map_err(|err| {
            error!("cannot open device of rdev {}: {}", rdev_uuid, err);
            VrtError::Io
        })?;

        if driver.nbd_size() < self.storage.rdevs[idx].real_size {
            return Err(VrtError::RdevTooSmall);
        }

        self.storage.rdevs[idx].up = true;
        self.devices[idx] = Some(driver);
        Ok(())
    }

    pub fn detach_device(&mut self, rdev_uuid: &ExaUuid) -> VrtResult<()> {
        let idx = self.storage.get_rdev_idx(rdev_uuid).ok_or(VrtError::NotFound)?;
        if let Some(mut driver) = self.devices[idx].take() {
            let _ = driver.nbd_close();
        }
        self.storage.rdevs[idx].up = false;
        Ok(())
    }

    /// Initialize the superblock areas of every attached device (group
    /// creation time)
    pub fn format_superblocks(&mut self) -> VrtResult<()> {
        let mut area = vec![0u8; SB_AREA_BYTES as usize];
        for driver in self.devices.iter_mut().flatten() {
            superblock_format(&mut area)?;
            write_sb_area(driver.as_mut(), &area)?;
        }
        Ok(())
    }

    pub fn start(&mut self) -> VrtResult<()> {
        if self.started {
            return Ok(());
        }
        self.recompute_status();
        if self.status == GroupStatus::Offline {
            return Err(VrtError::GroupOffline);
        }
        self.started = true;
        info!("group '{}' started ({:?})", self.name, self.status);
        Ok(())
    }

    pub fn stop(&mut self) -> VrtResult<()> {
        for volume in self.volumes.iter_mut() {
            volume.status = VolumeStatus::Stopped;
        }
        self.started = false;
        Ok(())
    }

    pub fn get_volume(&self, uuid: &ExaUuid) -> Option<&VrtVolume> {
        self.volumes.iter().find(|v| v.uuid == *uuid)
    }

    fn get_volume_mut(&mut self, uuid: &ExaUuid) -> Option<&mut VrtVolume> {
        self.volumes.iter_mut().find(|v| v.uuid == *uuid)
    }

    pub fn volume_create(&mut self, uuid: ExaUuid, name: &str, size: u64) -> VrtResult<()> {
        if !self.started {
            return Err(VrtError::GroupNotStarted);
        }
        if size == 0 || name.is_empty() {
            return Err(VrtError::InvalidArg);
        }
        if self.volumes.len() >= NBMAX_VOLUMES_PER_GROUP {
            return Err(VrtError::NoSpace);
        }
        if self.get_volume(&uuid).is_some()
            || self.volumes.iter().any(|v| v.name == name)
        {
            return Err(VrtError::AlreadyExists);
        }

        let lss = self.layout.logical_slot_size();
        let n_slots = (size + lss - 1) / lss;

        self.assembly.reserve_volume(&mut self.storage, uuid, n_slots)?;
        self.volumes.push(VrtVolume::new(uuid, name, size));

        match self.commit() {
            Ok(()) => Ok(()),
            Err(err) => {
                // Roll the reservation back so that memory and disk agree
                self.volumes.pop();
                let _ = self.assembly.release_volume(&mut self.storage, &uuid);
                Err(err)
            }
        }
    }

    pub fn volume_delete(&mut self, uuid: &ExaUuid) -> VrtResult<()> {
        let volume = self.get_volume(uuid).ok_or(VrtError::NotFound)?;
        if volume.is_started() {
            return Err(VrtError::InvalidArg);
        }

        self.assembly.release_volume(&mut self.storage, uuid)?;
        self.volumes.retain(|v| v.uuid != *uuid);
        self.commit()
    }

    pub fn volume_start(&mut self, uuid: &ExaUuid) -> VrtResult<()> {
        if !self.started {
            return Err(VrtError::GroupNotStarted);
        }
        let volume = self.get_volume_mut(uuid).ok_or(VrtError::NotFound)?;
        volume.status = VolumeStatus::Started;
        Ok(())
    }

    pub fn volume_stop(&mut self, uuid: &ExaUuid) -> VrtResult<()> {
        let volume = self.get_volume_mut(uuid).ok_or(VrtError::NotFound)?;
        volume.status = VolumeStatus::Stopped;
        Ok(())
    }

    fn check_request(&self, uuid: &ExaUuid, sector: u64, nb_sectors: u64,
                     buf_len: usize) -> VrtResult<()> {
        if !self.started {
            return Err(VrtError::GroupNotStarted);
        }
        if self.status == GroupStatus::Offline {
            return Err(VrtError::GroupOffline);
        }

        let volume = self.get_volume(uuid).ok_or(VrtError::NotFound)?;
        if !volume.is_started() {
            return Err(VrtError::InvalidArg);
        }
        if sector + nb_sectors > volume.size
            || buf_len as u64 != sectors_to_bytes(nb_sectors)
        {
            return Err(VrtError::InvalidArg);
        }
        Ok(())
    }

    fn submit(&mut self, rw: RwMode, reqs: &[IoSubRequest], buf: &mut [u8]) -> Option<VrtError> {
        let mut worst = None;

        for req in reqs {
            let from = sectors_to_bytes(req.buf_offset) as usize;
            let to = from + sectors_to_bytes(req.nb_sectors) as usize;

            let result = match self.devices[req.rdev_idx].as_mut() {
                None => Err(VrtError::Io),
                Some(driver) => match rw {
                    RwMode::Read => driver.nbd_read(req.rsector, &mut buf[from..to])
                        .map_err(|_| VrtError::Io),
                    RwMode::Write => driver.nbd_write(req.rsector, &buf[from..to])
                        .map_err(|_| VrtError::Io),
                },
            };

            worst = VrtError::worst(worst, result.err());
        }

        worst
    }

    /// Read from a started volume. The original request completes only when
    /// all sub-requests have, with the worst error if any.
    pub fn volume_read(&mut self, runtime: &VrtRuntime, uuid: &ExaUuid, sector: u64,
                       buf: &mut [u8]) -> VrtResult<()> {
        let nb_sectors = buf.len() as u64 / SECTOR_SIZE;
        self.check_request(uuid, sector, nb_sectors, buf.len())?;

        let _guard = runtime.begin_request();
        let reqs = self.layout.io_map(&self.storage, &self.assembly, uuid, RwMode::Read,
                                      sector, nb_sectors)?;

        match self.submit(RwMode::Read, &reqs, buf) {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    /// Write to a started volume. On RAIN-1, the covered dirty zones are
    /// marked before any column write issues and cleared only once both
    /// mirror halves have acknowledged.
    pub fn volume_write(&mut self, runtime: &VrtRuntime, uuid: &ExaUuid, sector: u64,
                        buf: &[u8]) -> VrtResult<()> {
        let nb_sectors = buf.len() as u64 / SECTOR_SIZE;
        self.check_request(uuid, sector, nb_sectors, buf.len())?;

        let _guard = runtime.begin_request();
        let reqs = self.layout.io_map(&self.storage, &self.assembly, uuid, RwMode::Write,
                                      sector, nb_sectors)?;

        let marked = self.mark_dirty_zones(uuid, sector, nb_sectors)?;

        // A fragment hit both mirror halves iff its buffer position shows
        // up twice; a degraded write leaves its zones dirty for resync
        let full_mirror = {
            let mut offsets: Vec<u64> = reqs.iter().map(|r| r.buf_offset).collect();
            offsets.sort_unstable();
            offsets.chunks(2).all(|pair| pair.len() == 2 && pair[0] == pair[1])
        };

        let mut buf_copy = buf.to_vec();
        let worst = self.submit(RwMode::Write, &reqs, &mut buf_copy);

        match worst {
            None => {
                if full_mirror {
                    // Both halves acknowledged, the zones are in sync again
                    if let LayoutInstance::Rain1(rxg) = &mut self.layout {
                        for zone in marked {
                            rxg.dirty_zones.clear(zone);
                        }
                    }
                }
                Ok(())
            }
            Some(err) => Err(err),
        }
    }

    fn mark_dirty_zones(&mut self, uuid: &ExaUuid, sector: u64,
                        nb_sectors: u64) -> VrtResult<Vec<u64>> {
        let lss = self.layout.logical_slot_size();

        let av = self.assembly.get_volume(uuid).ok_or(VrtError::NotFound)?;
        let mut ranges = vec![];
        let mut s = sector;
        let mut remaining = nb_sectors;
        while remaining > 0 {
            let (slot_idx, offset) = AssemblyGroup::map(av, s, lss)?;
            let run = remaining.min(lss - offset);
            ranges.push((slot_idx, offset, run));
            s += run;
            remaining -= run;
        }

        let mut marked = vec![];
        if let LayoutInstance::Rain1(rxg) = &mut self.layout {
            for (slot_idx, offset, run) in ranges {
                marked.extend(rxg.mark_write_dirty(slot_idx, offset, run));
            }
        }
        Ok(marked)
    }

    /// Serialize the whole group image: group header, storage, layout
    /// (with the assembly group), volumes.
    fn serialize_payload(&self) -> VrtResult<Vec<u8>> {
        let volumes_size: u64 = self.volumes.iter()
            .map(|v| 16 + 4 + v.name.len() as u64 + 8 + 4)
            .sum();
        let size = 4 + 4 + 16 + 4 + self.name.len() as u64 + 4
            + self.storage.serialized_size()
            + self.layout.serialized_size(&self.storage, &self.assembly)
            + 4 + volumes_size;

        let mut payload = vec![0u8; size as usize];
        let mut stream = MemoryStream::new(&mut payload, StreamAccess::Write);

        stream.write_u32_le(VRT_GROUP_HEADER_MAGIC)?;
        stream.write_u32_le(VRT_GROUP_HEADER_FORMAT)?;
        stream.write_all(&self.uuid.to_bytes())?;
        stream.write_u32_le(self.name.len() as u32)?;
        stream.write_all(self.name.as_bytes())?;
        stream.write_u32_le(match self.layout.kind() {
            LayoutKind::Sstriping => LAYOUT_WIRE_SSTRIPING,
            LayoutKind::Rain1 => LAYOUT_WIRE_RAIN1,
        })?;

        self.storage.serialize(&mut stream)?;
        self.layout.serialize(&self.storage, &self.assembly, &mut stream)?;

        stream.write_u32_le(self.volumes.len() as u32)?;
        for volume in &self.volumes {
            stream.write_all(&volume.uuid.to_bytes())?;
            stream.write_u32_le(volume.name.len() as u32)?;
            stream.write_all(volume.name.as_bytes())?;
            stream.write_u64_le(volume.size)?;
            stream.write_u32_le(volume.export_method.to_wire())?;
        }

        drop(stream);
        Ok(payload)
    }

    /// Write the group image to every attached rdev superblock with a
    /// shared new version. Survives as long as one copy lands.
    pub fn commit(&mut self) -> VrtResult<()> {
        let payload = self.serialize_payload()?;
        let old_version = self.sb_version;
        let new_version = old_version + 1;

        let mut worst = None;
        let mut successes = 0;

        for (idx, device) in self.devices.iter_mut().enumerate() {
            let driver = match device {
                Some(d) if self.storage.rdevs[idx].up => d.as_mut(),
                _ => continue,
            };

            let result = read_sb_area(driver)
                .and_then(|mut area| {
                    match superblock_write(&mut area, old_version, new_version,
                                           |s| s.write_all(&payload)) {
                        Ok(()) => {}
                        // An rdev whose copy fell behind (e.g. while its
                        // node was down) catches up with a fresh area
                        Err(VrtError::SbCorruption) => {
                            superblock_format(&mut area)?;
                            superblock_write(&mut area, 0, new_version,
                                             |s| s.write_all(&payload))?;
                        }
                        Err(err) => return Err(err),
                    }
                    write_sb_area(driver, &area)
                });

            match result {
                Ok(()) => successes += 1,
                Err(err) => {
                    warn!("superblock commit failed on rdev {}: {}",
                          self.storage.rdevs[idx].uuid, err);
                    worst = VrtError::worst(worst, Some(err));
                }
            }
        }

        if successes == 0 {
            return Err(worst.unwrap_or(VrtError::Io));
        }

        self.sb_version = new_version;
        debug!("group '{}' committed at version {} on {} rdevs",
               self.name, new_version, successes);
        Ok(())
    }

    /// Load a group from the superblock areas of its rdevs. The copy with
    /// the highest valid version is authoritative; corrupted copies are
    /// skipped.
    pub fn load(mut storage: Storage, nb_nodes_in_cluster: u32,
                areas: &mut [Vec<u8>]) -> VrtResult<Self> {
        let mut best: Option<(u64, Vec<u8>)> = None;

        for area in areas.iter_mut() {
            match superblock_read(area) {
                Ok((version, payload)) => {
                    if best.as_ref().map_or(true, |(v, _)| version > *v) {
                        best = Some((version, payload));
                    }
                }
                Err(err) => debug!("skipping one rdev's superblocks: {}", err),
            }
        }

        let (version, payload) = best.ok_or(VrtError::GroupOffline)?;

        let mut payload = payload;
        let mut stream = MemoryStream::new(&mut payload, StreamAccess::Read);

        let magic = stream.read_u32_le()?;
        if magic != VRT_GROUP_HEADER_MAGIC {
            return Err(VrtError::SbMagic);
        }
        let format = stream.read_u32_le()?;
        if format != VRT_GROUP_HEADER_FORMAT {
            return Err(VrtError::SbFormat);
        }

        let mut uuid_bytes = [0u8; 16];
        stream.read_exact(&mut uuid_bytes)?;
        let uuid = ExaUuid::from_bytes(&uuid_bytes);

        let name_len = stream.read_u32_le()?;
        let mut name_bytes = vec![0u8; name_len as usize];
        stream.read_exact(&mut name_bytes)?;
        let name = String::from_utf8(name_bytes).map_err(|_| VrtError::SbCorruption)?;

        let kind = match stream.read_u32_le()? {
            LAYOUT_WIRE_SSTRIPING => LayoutKind::Sstriping,
            LAYOUT_WIRE_RAIN1 => LayoutKind::Rain1,
            _ => return Err(VrtError::SbCorruption),
        };

        storage.deserialize(&mut stream)?;
        let (layout, assembly) = LayoutInstance::deserialize(kind, &mut storage, &mut stream)?;

        let nb_volumes = stream.read_u32_le()?;
        let mut volumes = Vec::with_capacity(nb_volumes as usize);
        for _ in 0..nb_volumes {
            stream.read_exact(&mut uuid_bytes)?;
            let vol_uuid = ExaUuid::from_bytes(&uuid_bytes);

            let name_len = stream.read_u32_le()?;
            let mut name_bytes = vec![0u8; name_len as usize];
            stream.read_exact(&mut name_bytes)?;
            let vol_name = String::from_utf8(name_bytes).map_err(|_| VrtError::SbCorruption)?;

            let size = stream.read_u64_le()?;
            let export = stream.read_u32_le()?;

            let mut volume = VrtVolume::new(vol_uuid, &vol_name, size);
            volume.export_method = crate::vrt_lib::volume::ExportMethod::from_wire(export)
                .ok_or(VrtError::SbCorruption)?;
            volumes.push(volume);
        }
        drop(stream);

        info!("loaded group '{}' ({}) at version {}", name, uuid, version);

        let nb_rdevs = storage.rdevs.len();
        Ok(Self {
            uuid,
            name,
            status: GroupStatus::Offline,
            storage,
            assembly,
            layout,
            volumes,
            sb_version: version,
            nb_nodes_in_cluster,
            nb_nodes_up: nb_nodes_in_cluster,
            started: false,
            devices: (0..nb_rdevs).map(|_| None).collect(),
        })
    }

    /// React to a new set of up nodes delivered by the cluster supervisor
    pub fn membership_changed(&mut self, upnodes: &ExaNodeset) {
        self.nb_nodes_up = upnodes.count();
        let mut any_went_down = false;

        for idx in 0..self.storage.rdevs.len() {
            let node_id = self.storage.rdevs[idx].node_id;
            let was_up = self.storage.rdevs[idx].up;
            let now_up = upnodes.contains(node_id) && self.devices[idx].is_some();

            if was_up && !now_up {
                let uuid = self.storage.rdevs[idx].uuid;
                warn!("rdev {} went down", uuid);
                any_went_down = true;
                if let LayoutInstance::Rain1(rxg) = &mut self.layout {
                    rxg.rdev_down(&self.storage, &uuid);
                }
            }
            self.storage.rdevs[idx].up = now_up;
        }

        // Advance the sync tag past the lost rdevs so that they come back
        // detectably stale
        if any_went_down {
            if let LayoutInstance::Rain1(rxg) = &mut self.layout {
                rxg.bump_sync_tag(&self.storage);
            }
        }

        self.recompute_status();

        if any_went_down && self.started && self.status != GroupStatus::Offline {
            if let Err(err) = self.commit() {
                warn!("metadata checkpoint after membership change failed: {}", err);
            }
        }
    }

    fn recompute_status(&mut self) {
        let any_down = self.storage.rdevs.iter().any(|r| !r.up);

        let new_status = match &self.layout {
            LayoutInstance::Sstriping(_) => {
                if any_down { GroupStatus::Offline } else { GroupStatus::Ok }
            }
            LayoutInstance::Rain1(rxg) => {
                let any_stale = self.storage.rdevs.iter()
                    .any(|r| rxg.rdev_needs_resync(&r.uuid));

                if !any_down && !any_stale {
                    GroupStatus::Ok
                } else if self.rain1_still_viable(rxg) {
                    GroupStatus::Degraded
                } else {
                    GroupStatus::Offline
                }
            }
        };

        if new_status != self.status {
            info!("group '{}' goes {:?}", self.name, new_status);
            self.status = new_status;
        }
    }

    /// A degraded RAIN-1 group stays usable while every mirror pair keeps
    /// one up half, the cluster still has node quorum, and the surviving
    /// SPOFs outweigh the lost ones (so metadata updates keep committing).
    fn rain1_still_viable(&self, rxg: &Rain1Group) -> bool {
        let active = (self.assembly.slot_width - rxg.nb_spare) as usize;
        let nb_pairs = active / 2;

        for slot in self.assembly.slots.iter().flatten() {
            for pair in 0..nb_pairs {
                let up = [2 * pair, 2 * pair + 1].iter().any(|col| {
                    self.storage.rdevs[slot.chunks[*col].rdev_idx].up
                });
                if !up {
                    return false;
                }
            }
        }

        if 2 * self.nb_nodes_up <= self.nb_nodes_in_cluster {
            return false;
        }

        let mut up_nodes = 0;
        let mut down_nodes = 0;
        for sg in &self.storage.spof_groups {
            let mut nodes = ExaNodeset::new();
            let mut spof_up = ExaNodeset::new();
            for i in &sg.rdev_idxs {
                let rdev = &self.storage.rdevs[*i];
                nodes.add(rdev.node_id);
                if rdev.up {
                    spof_up.add(rdev.node_id);
                }
            }
            up_nodes += spof_up.count();
            down_nodes += nodes.count() - spof_up.count();
        }

        up_nodes >= down_nodes
    }

    /// Replace a failed rdev in place. The new disk keeps the old one's
    /// position and SPOF, and must be resynced before it serves reads.
    pub fn replace_rdev(&mut self, old_uuid: &ExaUuid, new_uuid: ExaUuid,
                        new_nbd_uuid: ExaUuid,
                        driver: Box<dyn NbdDriver>) -> VrtResult<()> {
        let idx = self.storage.get_rdev_idx(old_uuid).ok_or(VrtError::NotFound)?;

        self.storage.rdevs[idx].replace(new_uuid, new_nbd_uuid)?;
        if let LayoutInstance::Rain1(rxg) = &mut self.layout {
            rxg.rdev_replaced(old_uuid, new_uuid);
        }

        self.attach_device(&new_uuid, driver)?;
        // The new disk holds no valid copy yet
        self.storage.rdevs[idx].up = true;

        let mut area = vec![0u8; SB_AREA_BYTES as usize];
        superblock_format(&mut area)?;
        let payload = self.serialize_payload()?;
        let version = self.sb_version;
        if let Some(d) = self.devices[idx].as_mut() {
            if version > 0 {
                // Bring the fresh superblocks up to the current version
                superblock_write(&mut area, 0, version, |s| s.write_all(&payload))?;
            }
            write_sb_area(d.as_mut(), &area)?;
        }

        self.resync()
    }

    /// Re-mirror every dirty zone column-to-column and stamp the recovered
    /// rdevs in sync. This is the explicit reintegration step after a node
    /// comes back up.
    pub fn resync(&mut self) -> VrtResult<()> {
        if matches!(self.layout, LayoutInstance::Sstriping(_)) {
            return Ok(());
        }

        let stale: Vec<ExaUuid> = {
            let rxg = match &self.layout {
                LayoutInstance::Rain1(rxg) => rxg,
                LayoutInstance::Sstriping(_) => unreachable!(),
            };
            self.storage.rdevs.iter()
                .filter(|r| r.up && rxg.rdev_needs_resync(&r.uuid))
                .map(|r| r.uuid)
                .collect()
        };

        // A stale disk missed every zone of the slots it backs
        let stale_idxs: Vec<usize> = stale.iter()
            .filter_map(|uuid| self.storage.get_rdev_idx(uuid))
            .collect();
        if let LayoutInstance::Rain1(rxg) = &mut self.layout {
            let lss = rxg.logical_slot_size;
            for (pool_idx, slot) in self.assembly.slots.iter().enumerate() {
                if let Some(slot) = slot {
                    if slot.chunks.iter().any(|c| stale_idxs.contains(&c.rdev_idx)) {
                        rxg.mark_write_dirty(pool_idx, 0, lss);
                    }
                }
            }
        }

        let rxg = match &self.layout {
            LayoutInstance::Rain1(rxg) => rxg.clone(),
            LayoutInstance::Sstriping(_) => unreachable!(),
        };

        let zones: Vec<u64> = rxg.dirty_zones.iter_dirty().collect();
        for zone in &zones {
            self.resync_zone(&rxg, *zone)?;
        }

        if let LayoutInstance::Rain1(rxg) = &mut self.layout {
            for zone in &zones {
                rxg.dirty_zones.clear(*zone);
            }
        }

        let storage = &self.storage;
        if let LayoutInstance::Rain1(rxg) = &mut self.layout {
            for uuid in &stale {
                rxg.rdev_resynced(storage, uuid);
            }
            rxg.bump_sync_tag(storage);
        }

        self.recompute_status();
        self.commit()
    }

    /// Copy one dirty zone from the in-sync mirror half to the stale one
    fn resync_zone(&mut self, rxg: &Rain1Group, zone: u64) -> VrtResult<()> {
        let (slot_idx, zone_offset, zone_len) = rxg.dirty_zones.zone_range(zone);

        if slot_idx >= self.assembly.slots.len() || self.assembly.slots[slot_idx].is_none() {
            return Ok(());
        }

        let lss = rxg.logical_slot_size;
        let len = zone_len.min(lss.saturating_sub(zone_offset));
        let su = rxg.su_size as u64;
        let active = (self.assembly.slot_width - rxg.nb_spare) as u64;
        let nb_pairs = active / 2;

        let mut buf = vec![0u8; sectors_to_bytes(su) as usize];
        let mut offset = zone_offset;
        let end = zone_offset + len;

        while offset < end {
            let run = (end - offset).min(su - offset % su);
            let pair = (offset / su) % nb_pairs;
            let sector_in_chunk = (offset / (su * nb_pairs)) * su + offset % su;

            let slot = self.assembly.slot(slot_idx);
            let cols = [2 * pair as u32, 2 * pair as u32 + 1];

            let col_state = |col: u32| {
                let rdev = &self.storage.rdevs[slot.chunks[col as usize].rdev_idx];
                (rdev.up, rxg.rdev_needs_resync(&rdev.uuid))
            };

            let source = cols.iter().copied()
                .find(|c| matches!(col_state(*c), (true, false)));
            let target = cols.iter().copied()
                .find(|c| matches!(col_state(*c), (true, true)));

            if let (Some(src), Some(dst)) = (source, target) {
                let (src_rdev, src_sector) = slot.map_sector_to_rdev(src, sector_in_chunk);
                let (dst_rdev, dst_sector) = slot.map_sector_to_rdev(dst, sector_in_chunk);

                let bytes = sectors_to_bytes(run) as usize;
                let src_driver = self.devices[src_rdev].as_mut().ok_or(VrtError::Io)?;
                src_driver.nbd_read(src_sector, &mut buf[..bytes]).map_err(|_| VrtError::Io)?;
                let dst_driver = self.devices[dst_rdev].as_mut().ok_or(VrtError::Io)?;
                dst_driver.nbd_write(dst_sector, &buf[..bytes]).map_err(|_| VrtError::Io)?;
            }

            offset += run;
        }

        Ok(())
    }
}
