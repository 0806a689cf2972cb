use crate::vrt_lib::assembly::AssemblyGroup;
use crate::vrt_lib::desc::{kbytes_to_sectors, NBMAX_SPARES_PER_GROUP};
use crate::vrt_lib::error::{VrtError, VrtResult};
use crate::vrt_lib::layout::{IoSubRequest, RwMode};
use crate::vrt_lib::nodeset::ExaNodeset;
use crate::vrt_lib::storage::Storage;
use crate::vrt_lib::stream::{Stream, StreamExt};
use crate::vrt_lib::uuid::ExaUuid;
use log::*;

pub const RAIN1_HEADER_MAGIC: u32 = 0xA2A3A4A5;
pub const RAIN1_HEADER_FORMAT: u32 = 1;

/// Monotonic tag detecting stale rdev copies after recovery. Comparison is
/// wraparound-safe, so the tag can run forever.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncTag(pub u32);

pub const SYNC_TAG_ZERO: SyncTag = SyncTag(0);

impl SyncTag {
    pub fn inc(self) -> SyncTag {
        SyncTag(self.0.wrapping_add(1))
    }

    pub fn is_older_than(self, other: SyncTag) -> bool {
        (other.0.wrapping_sub(self.0) as i32) > 0
    }
}

/*
 * RainX admissibility rules. All three must hold at group creation and
 * after each membership change.
 */

/// Replication rule: enough columns for the two mirror halves plus the
/// reserved spare columns.
pub fn rainx_rule_replication_satisfied(slot_width: u32, nb_spare: u32) -> bool {
    slot_width >= 2 + nb_spare
}

/// Administrability rule: the involved SPOFs must tolerate the loss of any
/// `1 + nb_spare` of them while the surviving nodes still outweigh the lost
/// ones, so that metadata updates can keep committing.
pub fn rainx_rule_administrability_satisfied(involved_spof_sizes: &[u32],
                                             nb_spare: u32) -> bool {
    if involved_spof_sizes.len() < (2 * nb_spare + 2) as usize {
        return false;
    }

    let mut sizes = involved_spof_sizes.to_vec();
    sizes.sort_unstable_by(|a, b| b.cmp(a));

    let removed: u32 = sizes.iter().take(1 + nb_spare as usize).sum();
    let rest: u32 = sizes.iter().skip(1 + nb_spare as usize).sum();

    rest >= removed
}

/// Quorum rule: losing the `1 + nb_spare` biggest SPOFs must leave strictly
/// more than half of the cluster's nodes.
pub fn rainx_rule_quorum_satisfied(all_spof_sizes: &[u32], nb_spare: u32,
                                   num_nodes_in_cluster: u32) -> bool {
    let mut sizes = all_spof_sizes.to_vec();
    sizes.sort_unstable_by(|a, b| b.cmp(a));

    let total: u32 = sizes.iter().sum();
    let removed: u32 = sizes.iter().take(1 + nb_spare as usize).sum();
    let remaining = total - removed;

    2 * remaining > num_nodes_in_cluster
}

/// In-memory dirty-zone bitmap. Zones are tracked per slot so that their
/// indexes survive volume creation and deletion.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DirtyZoneLog {
    /// Zone size in sectors
    zone_size: u64,
    zones_per_slot: u64,
    words: Vec<u64>,
}

impl DirtyZoneLog {
    pub fn new(zone_size_sectors: u64, logical_slot_size: u64) -> Self {
        Self {
            zone_size: zone_size_sectors,
            zones_per_slot: (logical_slot_size + zone_size_sectors - 1) / zone_size_sectors,
            words: vec![],
        }
    }

    fn zone_index(&self, slot_idx: usize, offset: u64) -> u64 {
        slot_idx as u64 * self.zones_per_slot + offset / self.zone_size
    }

    fn ensure(&mut self, zone: u64) {
        let word = (zone / 64) as usize;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
    }

    pub fn is_dirty(&self, zone: u64) -> bool {
        let word = (zone / 64) as usize;
        word < self.words.len() && self.words[word] & (1 << (zone % 64)) != 0
    }

    /// Mark the zones covering `[offset, offset + nb_sectors)` of a slot.
    /// Returns the zones that were not dirty before, i.e. those that must
    /// be persisted before the write may issue.
    pub fn mark(&mut self, slot_idx: usize, offset: u64, nb_sectors: u64) -> Vec<u64> {
        let first = self.zone_index(slot_idx, offset);
        let last = self.zone_index(slot_idx, offset + nb_sectors.max(1) - 1);

        let mut newly_dirty = vec![];
        for zone in first..=last {
            self.ensure(zone);
            if !self.is_dirty(zone) {
                self.words[(zone / 64) as usize] |= 1 << (zone % 64);
                newly_dirty.push(zone);
            }
        }
        newly_dirty
    }

    pub fn clear(&mut self, zone: u64) {
        let word = (zone / 64) as usize;
        if word < self.words.len() {
            self.words[word] &= !(1 << (zone % 64));
        }
    }

    pub fn iter_dirty(&self) -> impl Iterator<Item = u64> + '_ {
        (0..self.words.len() as u64 * 64).filter(move |z| self.is_dirty(*z))
    }

    /// Sector range of a zone: (slot index, first offset, length)
    pub fn zone_range(&self, zone: u64) -> (usize, u64, u64) {
        let slot_idx = (zone / self.zones_per_slot) as usize;
        let offset = (zone % self.zones_per_slot) * self.zone_size;
        (slot_idx, offset, self.zone_size)
    }

    fn serialized_size(&self) -> u64 {
        8 + self.words.len() as u64 * 8
    }

    fn serialize(&self, stream: &mut dyn Stream) -> VrtResult<()> {
        stream.write_u64_le(self.words.len() as u64)?;
        for word in &self.words {
            stream.write_u64_le(*word)?;
        }
        Ok(())
    }

    fn deserialize(&mut self, stream: &mut dyn Stream) -> VrtResult<()> {
        let n = stream.read_u64_le()?;
        self.words = Vec::with_capacity(n as usize);
        for _ in 0..n {
            self.words.push(stream.read_u64_le()?);
        }
        Ok(())
    }
}

/// Per-rdev metadata carried by the layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rain1RdevHeader {
    pub uuid: ExaUuid,
    pub sync_tag: SyncTag,
}

/// Mirrored layout with spares. Active columns are paired into mirrors;
/// the last `nb_spare` columns of every slot stand by for rebuilds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rain1Group {
    pub blended_stripes: bool,
    /// Stripe unit, in sectors
    pub su_size: u32,
    /// Largest device sub-request, in sectors
    pub max_sectors: u32,
    pub sync_tag: SyncTag,
    pub logical_slot_size: u64,
    /// Dirty zone size, in KiB
    pub dirty_zone_size: u32,
    pub nb_spare: u32,
    /// Nodes currently resyncing
    pub nodes_resync: ExaNodeset,
    /// Nodes whose rdevs must be re-applied once reachable
    pub nodes_update: ExaNodeset,
    pub rdev_headers: Vec<Rain1RdevHeader>,
    pub dirty_zones: DirtyZoneLog,
}

impl Rain1Group {
    /// Validate the three admissibility rules for the given topology
    pub fn check_admissibility(storage: &Storage, slot_width: u32, nb_spare: u32,
                               num_nodes_in_cluster: u32) -> VrtResult<()> {
        let spof_sizes: Vec<u32> = storage.spof_groups.iter()
            .map(|sg| storage.spof_group_nodes(sg).count())
            .collect();

        if !rainx_rule_replication_satisfied(slot_width, nb_spare) {
            warn!("replication rule infringed: slot width {} < 2 + {} spares",
                  slot_width, nb_spare);
            return Err(VrtError::InvalidArg);
        }

        if !rainx_rule_administrability_satisfied(&spof_sizes, nb_spare) {
            warn!("administrability rule infringed over {} SPOFs", spof_sizes.len());
            return Err(VrtError::InvalidArg);
        }

        if !rainx_rule_quorum_satisfied(&spof_sizes, nb_spare, num_nodes_in_cluster) {
            warn!("quorum rule infringed for a {}-node cluster", num_nodes_in_cluster);
            return Err(VrtError::InvalidArg);
        }

        Ok(())
    }

    pub fn create(storage: &Storage, slot_width: u32, chunk_size_sectors: u64,
                  su_size: u32, dirty_zone_size_kb: u32, nb_spare: u32,
                  num_nodes_in_cluster: u32) -> VrtResult<(Self, AssemblyGroup)> {
        if su_size == 0 || chunk_size_sectors % su_size as u64 != 0 {
            return Err(VrtError::InvalidArg);
        }

        if dirty_zone_size_kb == 0 || nb_spare > NBMAX_SPARES_PER_GROUP {
            return Err(VrtError::InvalidArg);
        }

        if slot_width as usize > storage.spof_groups.len() {
            return Err(VrtError::InvalidArg);
        }

        Self::check_admissibility(storage, slot_width, nb_spare, num_nodes_in_cluster)?;

        let nb_pairs = ((slot_width - nb_spare) / 2) as u64;
        let logical_slot_size = nb_pairs * chunk_size_sectors;

        let rdev_headers = storage.iter_rdevs()
            .map(|r| Rain1RdevHeader { uuid: r.uuid, sync_tag: SYNC_TAG_ZERO })
            .collect();

        let rxg = Self {
            blended_stripes: false,
            su_size,
            max_sectors: 1024,
            sync_tag: SYNC_TAG_ZERO,
            logical_slot_size,
            dirty_zone_size: dirty_zone_size_kb,
            nb_spare,
            nodes_resync: ExaNodeset::new(),
            nodes_update: ExaNodeset::new(),
            rdev_headers,
            dirty_zones: DirtyZoneLog::new(kbytes_to_sectors(dirty_zone_size_kb as u64),
                                           logical_slot_size),
        };
        let ag = AssemblyGroup::setup(slot_width, chunk_size_sectors);

        Ok((rxg, ag))
    }

    fn nb_pairs(&self, slot_width: u32) -> u64 {
        ((slot_width - self.nb_spare) / 2) as u64
    }

    /// Translate a block request into mirror sub-requests. Reads pick the
    /// first up mirror half; writes go to every up half.
    pub fn io_map(&self, storage: &Storage, ag: &AssemblyGroup, volume_uuid: &ExaUuid,
                  rw: RwMode, sector: u64, nb_sectors: u64) -> VrtResult<Vec<IoSubRequest>> {
        let av = ag.get_volume(volume_uuid).ok_or(VrtError::NotFound)?;
        let su = self.su_size as u64;
        let nb_pairs = self.nb_pairs(ag.slot_width);

        let mut reqs = vec![];
        let mut s = sector;
        let mut remaining = nb_sectors;

        while remaining > 0 {
            let (slot_idx, offset) = AssemblyGroup::map(av, s, self.logical_slot_size)?;
            let slot = ag.slot(slot_idx);

            let pair = (offset / su) % nb_pairs;
            let sector_in_chunk = (offset / (su * nb_pairs)) * su + offset % su;

            let run = remaining
                .min(su - offset % su)
                .min(self.max_sectors as u64);

            let columns = [2 * pair as u32, 2 * pair as u32 + 1];
            let up = |col: u32| {
                let chunk = &slot.chunks[col as usize];
                storage.rdevs[chunk.rdev_idx].up
            };

            match rw {
                RwMode::Read => {
                    let col = columns.iter().copied().find(|c| up(*c))
                        .ok_or(VrtError::Io)?;
                    let (rdev_idx, rsector) = slot.map_sector_to_rdev(col, sector_in_chunk);
                    reqs.push(IoSubRequest { rdev_idx, rsector, nb_sectors: run,
                                             buf_offset: s - sector });
                }
                RwMode::Write => {
                    let mut any = false;
                    for col in columns {
                        if !up(col) {
                            continue;
                        }
                        let (rdev_idx, rsector) = slot.map_sector_to_rdev(col, sector_in_chunk);
                        reqs.push(IoSubRequest { rdev_idx, rsector, nb_sectors: run,
                                                 buf_offset: s - sector });
                        any = true;
                    }
                    if !any {
                        return Err(VrtError::Io);
                    }
                }
            }

            s += run;
            remaining -= run;
        }

        Ok(reqs)
    }

    /// Dirty-zone bookkeeping for a write request: returns the zones that
    /// must be persisted before the column writes may issue.
    pub fn mark_write_dirty(&mut self, av_slot_idx: usize, offset: u64,
                            nb_sectors: u64) -> Vec<u64> {
        self.dirty_zones.mark(av_slot_idx, offset, nb_sectors)
    }

    /// Advance the sync tag on a metadata checkpoint. Up rdevs are stamped
    /// with the new tag; a slower rdev tag marks the device for resync.
    pub fn bump_sync_tag(&mut self, storage: &Storage) {
        self.sync_tag = self.sync_tag.inc();
        for header in self.rdev_headers.iter_mut() {
            if let Some(rdev) = storage.get_rdev(&header.uuid) {
                if rdev.up {
                    header.sync_tag = self.sync_tag;
                }
            }
        }
    }

    pub fn rdev_header(&self, uuid: &ExaUuid) -> Option<&Rain1RdevHeader> {
        self.rdev_headers.iter().find(|h| h.uuid == *uuid)
    }

    /// An rdev whose tag is older than the group's missed some zones and
    /// must be resynced
    pub fn rdev_needs_resync(&self, uuid: &ExaUuid) -> bool {
        match self.rdev_header(uuid) {
            Some(h) => h.sync_tag.is_older_than(self.sync_tag),
            None => false,
        }
    }

    /// React to an rdev going down: its node's updates will have to be
    /// replayed when it comes back.
    pub fn rdev_down(&mut self, storage: &Storage, uuid: &ExaUuid) {
        if let Some(rdev) = storage.get_rdev(uuid) {
            self.nodes_update.add(rdev.node_id);
        }
    }

    /// Track a replaced disk: the layout keeps the rdev's slot in its
    /// per-rdev headers, but the new disk holds no valid copy yet.
    pub fn rdev_replaced(&mut self, old_uuid: &ExaUuid, new_uuid: ExaUuid) {
        if let Some(header) = self.rdev_headers.iter_mut().find(|h| h.uuid == *old_uuid) {
            header.uuid = new_uuid;
            header.sync_tag = SyncTag(self.sync_tag.0.wrapping_sub(1));
        }
    }

    /// Reintegrate an rdev: the caller has replayed the missed zones, the
    /// device is in sync again.
    pub fn rdev_resynced(&mut self, storage: &Storage, uuid: &ExaUuid) {
        if let Some(rdev) = storage.get_rdev(uuid) {
            self.nodes_resync.del(rdev.node_id);
            self.nodes_update.del(rdev.node_id);
        }
        let tag = self.sync_tag;
        if let Some(header) = self.rdev_headers.iter_mut().find(|h| h.uuid == *uuid) {
            header.sync_tag = tag;
        }
    }

    /// Swap failed data columns with spare columns.
    ///
    /// For every slot with a data column on a down rdev, the chunk of an up
    /// spare column takes its place (the spare chunk lives in a distinct
    /// SPOF already, so the placement invariant is preserved). Returns the
    /// number of columns reassigned.
    pub fn reassign_spares(&mut self, storage: &Storage,
                           ag: &mut AssemblyGroup) -> VrtResult<u32> {
        if self.nb_spare == 0 {
            return Ok(0);
        }

        let width = ag.slot_width as usize;
        let active = width - self.nb_spare as usize;
        let mut reassigned = 0;

        for slot in ag.slots.iter_mut().flatten() {
            for data_col in 0..active {
                if storage.rdevs[slot.chunks[data_col].rdev_idx].up {
                    continue;
                }

                // Pick the up spare whose rdev has the fewest used chunks
                let spare_col = (active..width)
                    .filter(|c| storage.rdevs[slot.chunks[*c].rdev_idx].up)
                    .min_by_key(|c| storage.rdevs[slot.chunks[*c].rdev_idx].used_chunks_count());

                match spare_col {
                    Some(spare) => {
                        debug!("slot column {} reassigned to spare column {}", data_col, spare);
                        slot.chunks.swap(data_col, spare);
                        reassigned += 1;
                    }
                    None => return Err(VrtError::NoSpace),
                }
            }
        }

        Ok(reassigned)
    }

    pub fn serialized_size(&self, _storage: &Storage, ag: &AssemblyGroup) -> u64 {
        76 + self.rdev_headers.len() as u64 * 20
            + self.dirty_zones.serialized_size()
            + ag.serialized_size()
    }

    pub fn serialize(&self, storage: &Storage, ag: &AssemblyGroup,
                     stream: &mut dyn Stream) -> VrtResult<()> {
        stream.write_u32_le(RAIN1_HEADER_MAGIC)?;
        stream.write_u32_le(RAIN1_HEADER_FORMAT)?;
        stream.write_u32_le(self.blended_stripes as u32)?;
        stream.write_u32_le(self.su_size)?;
        stream.write_u32_le(self.max_sectors)?;
        stream.write_u32_le(self.nb_spare)?;
        stream.write_u32_le(self.sync_tag.0)?;
        stream.write_u64_le(self.logical_slot_size)?;
        stream.write_u32_le(self.dirty_zone_size)?;
        stream.write_all(&self.nodes_resync.to_bytes())?;
        stream.write_all(&self.nodes_update.to_bytes())?;
        stream.write_u32_le(self.rdev_headers.len() as u32)?;

        for header in &self.rdev_headers {
            stream.write_all(&header.uuid.to_bytes())?;
            stream.write_u32_le(header.sync_tag.0)?;
        }

        self.dirty_zones.serialize(stream)?;

        ag.serialize(storage, stream)
    }

    pub fn deserialize(storage: &mut Storage,
                       stream: &mut dyn Stream) -> VrtResult<(Self, AssemblyGroup)> {
        let magic = stream.read_u32_le()?;
        if magic != RAIN1_HEADER_MAGIC {
            return Err(VrtError::SbMagic);
        }

        let format = stream.read_u32_le()?;
        if format != RAIN1_HEADER_FORMAT {
            return Err(VrtError::SbFormat);
        }

        let blended_stripes = stream.read_u32_le()? != 0;
        let su_size = stream.read_u32_le()?;
        let max_sectors = stream.read_u32_le()?;
        let nb_spare = stream.read_u32_le()?;
        let sync_tag = SyncTag(stream.read_u32_le()?);
        let logical_slot_size = stream.read_u64_le()?;
        let dirty_zone_size = stream.read_u32_le()?;

        let mut nodes_bytes = [0u8; 16];
        stream.read_exact(&mut nodes_bytes)?;
        let nodes_resync = ExaNodeset::from_bytes(&nodes_bytes);
        stream.read_exact(&mut nodes_bytes)?;
        let nodes_update = ExaNodeset::from_bytes(&nodes_bytes);

        let nb_rdevs = stream.read_u32_le()?;
        if nb_rdevs as usize != storage.num_realdevs() {
            return Err(VrtError::SbCorruption);
        }

        let mut rdev_headers = Vec::with_capacity(nb_rdevs as usize);
        for _ in 0..nb_rdevs {
            let mut uuid_bytes = [0u8; 16];
            stream.read_exact(&mut uuid_bytes)?;
            let uuid = ExaUuid::from_bytes(&uuid_bytes);
            if storage.get_rdev(&uuid).is_none() {
                return Err(VrtError::SbCorruption);
            }
            let tag = SyncTag(stream.read_u32_le()?);
            rdev_headers.push(Rain1RdevHeader { uuid, sync_tag: tag });
        }

        let mut dirty_zones =
            DirtyZoneLog::new(kbytes_to_sectors(dirty_zone_size as u64), logical_slot_size);
        dirty_zones.deserialize(stream)?;

        let ag = AssemblyGroup::deserialize(storage, stream)?;

        let rxg = Self {
            blended_stripes,
            su_size,
            max_sectors,
            sync_tag,
            logical_slot_size,
            dirty_zone_size,
            nb_spare,
            nodes_resync,
            nodes_update,
            rdev_headers,
            dirty_zones,
        };

        Ok((rxg, ag))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vrt_lib::desc::{VRT_MIN_CHUNK_SIZE, VRT_MIN_DIRTY_ZONE_SIZE};
    use crate::vrt_lib::storage::test_support::make_storage;
    use crate::vrt_lib::stream::{MemoryStream, StreamAccess};

    const SU: u32 = 8;

    fn chunk_sectors() -> u64 {
        kbytes_to_sectors(VRT_MIN_CHUNK_SIZE as u64)
    }

    fn make_rain1(nb_spofs: u32, slot_width: u32, nb_spare: u32)
                  -> VrtResult<(Storage, Rain1Group, AssemblyGroup)> {
        let storage = make_storage(nb_spofs, 1, 8, VRT_MIN_CHUNK_SIZE);
        let (rxg, ag) = Rain1Group::create(&storage, slot_width, chunk_sectors(), SU,
                                           VRT_MIN_DIRTY_ZONE_SIZE, nb_spare, nb_spofs)?;
        Ok((storage, rxg, ag))
    }

    /// Width 4 with 2 spares over 7 single-node SPOFs holds the
    /// replication rule; width 3 does not.
    #[test]
    fn replication_rule_cases() {
        assert!(rainx_rule_replication_satisfied(4, 2));
        assert!(!rainx_rule_replication_satisfied(3, 2));
        assert!(rainx_rule_replication_satisfied(2, 0));
        assert!(!rainx_rule_replication_satisfied(1, 0));

        let (_, _, ag) = make_rain1(7, 4, 2).unwrap();
        assert_eq!(ag.slot_width, 4);
        assert!(make_rain1(7, 3, 2).is_err());
    }

    #[test]
    fn administrability_minimum_spof_count() {
        for nb_spare in 0..=NBMAX_SPARES_PER_GROUP {
            let min_spofs = (2 * nb_spare + 2) as usize;

            let sizes = vec![1u32; min_spofs];
            assert!(rainx_rule_administrability_satisfied(&sizes, nb_spare));

            let sizes = vec![1u32; min_spofs + 1];
            assert!(rainx_rule_administrability_satisfied(&sizes, nb_spare));

            let sizes = vec![1u32; min_spofs - 1];
            assert!(!rainx_rule_administrability_satisfied(&sizes, nb_spare));
        }
    }

    #[test]
    fn administrability_uneven_spof_sizes() {
        // Losing the two biggest SPOFs {3,2} outweighs the five remaining
        assert!(!rainx_rule_administrability_satisfied(&[2, 3, 1, 1, 1, 1, 1], 2));
        // {3} lost vs {2,2} surviving is administrable
        assert!(rainx_rule_administrability_satisfied(&[2, 2, 3], 0));
        // Two SPOFs of 3 and 4 nodes: losing {4} leaves only {3}
        assert!(!rainx_rule_administrability_satisfied(&[3, 4], 0));
    }

    /// SPOF sizes {1,2,4} in a 7-node cluster fail the quorum rule;
    /// {1,1,1} in a 3-node cluster hold it.
    #[test]
    fn quorum_rule_cases() {
        assert!(!rainx_rule_quorum_satisfied(&[1, 2, 4], 0, 7));
        assert!(rainx_rule_quorum_satisfied(&[1, 1, 1], 0, 3));
        assert!(!rainx_rule_quorum_satisfied(&[4, 4], 0, 8));
        assert!(rainx_rule_quorum_satisfied(&[1, 1, 1, 1], 0, 4));
    }

    #[test]
    fn sync_tag_comparison_survives_wraparound() {
        let old = SyncTag(u32::MAX);
        let new = old.inc();
        assert_eq!(new, SyncTag(0));
        assert!(old.is_older_than(new));
        assert!(!new.is_older_than(old));
        assert!(!old.is_older_than(old));
    }

    #[test]
    fn bump_sync_tag_leaves_down_rdevs_behind() -> VrtResult<()> {
        let (mut storage, mut rxg, _ag) = make_rain1(3, 2, 0)?;
        for rdev in storage.rdevs.iter_mut() {
            rdev.up = true;
        }
        let down_uuid = storage.rdevs[1].uuid;
        storage.rdevs[1].up = false;

        rxg.bump_sync_tag(&storage);

        assert!(!rxg.rdev_needs_resync(&storage.rdevs[0].uuid));
        assert!(rxg.rdev_needs_resync(&down_uuid));

        storage.rdevs[1].up = true;
        rxg.rdev_resynced(&storage, &down_uuid);
        assert!(!rxg.rdev_needs_resync(&down_uuid));
        Ok(())
    }

    #[test]
    fn write_maps_to_both_mirror_halves() -> VrtResult<()> {
        let (mut storage, rxg, mut ag) = make_rain1(3, 2, 0)?;
        for rdev in storage.rdevs.iter_mut() {
            rdev.up = true;
        }
        let uuid = ExaUuid::new(0, 0, 0, 9);
        ag.reserve_volume(&mut storage, uuid, 1)?;

        let reqs = rxg.io_map(&storage, &ag, &uuid, RwMode::Write, 0, 4)?;
        assert_eq!(reqs.len(), 2);
        assert_ne!(reqs[0].rdev_idx, reqs[1].rdev_idx);
        assert_eq!(reqs[0].nb_sectors, 4);

        let slot = ag.slot(ag.get_volume(&uuid).unwrap().slot_idxs[0]);
        let spofs: Vec<u32> = reqs.iter()
            .map(|r| storage.rdevs[r.rdev_idx].spof_id)
            .collect();
        assert_ne!(spofs[0], spofs[1]);
        assert_eq!(reqs[0].rsector, slot.chunks[0].offset);
        Ok(())
    }

    #[test]
    fn read_falls_back_to_surviving_mirror() -> VrtResult<()> {
        let (mut storage, rxg, mut ag) = make_rain1(3, 2, 0)?;
        for rdev in storage.rdevs.iter_mut() {
            rdev.up = true;
        }
        let uuid = ExaUuid::new(0, 0, 0, 9);
        ag.reserve_volume(&mut storage, uuid, 1)?;

        let healthy = rxg.io_map(&storage, &ag, &uuid, RwMode::Read, 0, 2)?;
        assert_eq!(healthy.len(), 1);
        let primary = healthy[0].rdev_idx;

        storage.rdevs[primary].up = false;
        let degraded = rxg.io_map(&storage, &ag, &uuid, RwMode::Read, 0, 2)?;
        assert_eq!(degraded.len(), 1);
        assert_ne!(degraded[0].rdev_idx, primary);

        let secondary = degraded[0].rdev_idx;
        storage.rdevs[secondary].up = false;
        assert_eq!(rxg.io_map(&storage, &ag, &uuid, RwMode::Read, 0, 2).map(|_| ()),
                   Err(VrtError::Io));
        Ok(())
    }

    #[test]
    fn dirty_zones_mark_once_until_cleared() -> VrtResult<()> {
        let (_, mut rxg, _) = make_rain1(3, 2, 0)?;
        let zone_sectors = kbytes_to_sectors(VRT_MIN_DIRTY_ZONE_SIZE as u64);

        let newly = rxg.mark_write_dirty(0, 0, 4);
        assert_eq!(newly.len(), 1);

        // Same zone again: already dirty, nothing to persist
        assert!(rxg.mark_write_dirty(0, 8, 4).is_empty());

        // Straddling a zone boundary dirties the next zone only
        let newly = rxg.mark_write_dirty(0, zone_sectors - 2, 4);
        assert_eq!(newly.len(), 1);

        let dirty: Vec<u64> = rxg.dirty_zones.iter_dirty().collect();
        assert_eq!(dirty.len(), 2);

        for zone in dirty {
            rxg.dirty_zones.clear(zone);
        }
        assert_eq!(rxg.dirty_zones.iter_dirty().count(), 0);
        Ok(())
    }

    #[test]
    fn zone_range_inverts_zone_index() -> VrtResult<()> {
        let (_, mut rxg, _) = make_rain1(3, 2, 0)?;
        let zone_sectors = kbytes_to_sectors(VRT_MIN_DIRTY_ZONE_SIZE as u64);

        let zones = rxg.mark_write_dirty(1, zone_sectors + 3, 1);
        assert_eq!(zones.len(), 1);
        let (slot_idx, offset, len) = rxg.dirty_zones.zone_range(zones[0]);
        assert_eq!(slot_idx, 1);
        assert_eq!(offset, zone_sectors);
        assert_eq!(len, zone_sectors);
        Ok(())
    }

    #[test]
    fn spare_reassignment_preserves_spof_exclusivity() -> VrtResult<()> {
        // Width 4 = one mirror pair + 2 spares, 7 single-node SPOFs
        let (mut storage, mut rxg, mut ag) = make_rain1(7, 4, 2)?;
        for rdev in storage.rdevs.iter_mut() {
            rdev.up = true;
        }
        let uuid = ExaUuid::new(0, 0, 0, 9);
        ag.reserve_volume(&mut storage, uuid, 2)?;

        let slot_idx = ag.get_volume(&uuid).unwrap().slot_idxs[0];
        let failed_rdev = ag.slot(slot_idx).chunks[0].rdev_idx;
        storage.rdevs[failed_rdev].up = false;

        let reassigned = rxg.reassign_spares(&storage, &mut ag)?;
        assert!(reassigned >= 1);

        for slot in ag.slots.iter().flatten() {
            // Data columns all land on up rdevs again
            for col in 0..2 {
                assert!(storage.rdevs[slot.chunks[col].rdev_idx].up);
            }
            // And the slot still never repeats a SPOF
            let mut spofs: Vec<u32> = slot.chunks.iter()
                .map(|c| storage.rdevs[c.rdev_idx].spof_id)
                .collect();
            spofs.sort_unstable();
            spofs.dedup();
            assert_eq!(spofs.len(), 4);
        }
        Ok(())
    }

    #[test]
    fn serialize_deserialize_roundtrip() -> VrtResult<()> {
        let (mut storage, mut rxg, mut ag) = make_rain1(3, 2, 0)?;
        for rdev in storage.rdevs.iter_mut() {
            rdev.up = true;
        }
        let uuid = ExaUuid::new(0, 0, 0, 9);
        ag.reserve_volume(&mut storage, uuid, 2)?;
        rxg.bump_sync_tag(&storage);
        rxg.mark_write_dirty(0, 0, 16);
        rxg.nodes_update.add(2);

        let mut buf = vec![0u8; rxg.serialized_size(&storage, &ag) as usize];
        {
            let mut stream = MemoryStream::new(&mut buf, StreamAccess::Write);
            rxg.serialize(&storage, &ag, &mut stream)?;
        }

        let mut sibling = make_storage(3, 1, 8, VRT_MIN_CHUNK_SIZE);
        let mut stream = MemoryStream::new(&mut buf, StreamAccess::Read);
        let (copy, ag_copy) = Rain1Group::deserialize(&mut sibling, &mut stream)?;

        assert_eq!(copy, rxg);
        assert!(ag.equals(&ag_copy, &storage, &sibling));
        Ok(())
    }
}
