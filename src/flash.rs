//! Intel Flash Descriptor
//!
//! A descriptor image opens with 16 padding bytes and the `5A A5 F0 0F` signature. The
//! descriptor map at +20 locates the region and master tables (offsets in 0x10 units);
//! region bases and limits are in 0x1000 units. The BIOS region is scanned for firmware
//! volumes, the ME region is handed to the ME container recognizer, and the GbE and PDR
//! regions are kept opaque.
//!
//! Regions are views into the descriptor at fixed offsets, so the descriptor re-emits its
//! captured bytes on rebuild.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!

use std::io::{self, Write};
use std::path::Path;

use crate::error::Error;
use crate::fw_fs::volume::find_volumes;
use crate::me::MeContainer;
use crate::object::{FirmwareObject, ParseContext, ts, write_file};
use crate::reader::{clamped, read_u8, read_u16};

/// Descriptor signature, stored at offset 16.
pub const FLASH_HEADER: [u8; 4] = [0x5A, 0xA5, 0xF0, 0x0F];

/// FLMAP: offsets and counts for the descriptor's tables.
#[derive(Debug, Clone, Copy, Default)]
pub struct DescriptorMap {
    pub component_base: u8,
    pub number_of_flash_chips: u8,
    pub region_base: u8,
    pub number_of_regions: u8,
    pub master_base: u8,
    pub number_of_masters: u8,
    pub pch_straps_base: u8,
    pub number_of_pch_straps: u8,
    pub proc_straps_base: u8,
    pub number_of_proc_straps: u8,
    pub icc_table_base: u8,
    pub number_of_icc_entries: u8,
}

impl DescriptorMap {
    fn parse(data: &[u8]) -> Result<DescriptorMap, Error> {
        Error::check_len(data, 16)?;
        Ok(DescriptorMap {
            component_base: read_u8(data, 0)?,
            number_of_flash_chips: read_u8(data, 1)?,
            region_base: read_u8(data, 2)?,
            number_of_regions: read_u8(data, 3)?,
            master_base: read_u8(data, 4)?,
            number_of_masters: read_u8(data, 5)?,
            pch_straps_base: read_u8(data, 6)?,
            number_of_pch_straps: read_u8(data, 7)?,
            proc_straps_base: read_u8(data, 8)?,
            number_of_proc_straps: read_u8(data, 9)?,
            icc_table_base: read_u8(data, 10)?,
            number_of_icc_entries: read_u8(data, 11)?,
        })
    }
}

/// FLREG: base/limit pairs for each region.
#[derive(Debug, Clone, Copy, Default)]
struct RegionTable {
    bios_base: u16,
    bios_limit: u16,
    me_base: u16,
    me_limit: u16,
    gbe_base: u16,
    gbe_limit: u16,
    pdr_base: u16,
    pdr_limit: u16,
}

impl RegionTable {
    fn parse(data: &[u8]) -> Result<RegionTable, Error> {
        Error::check_len(data, 20)?;
        Ok(RegionTable {
            bios_base: read_u16(data, 4)?,
            bios_limit: read_u16(data, 6)?,
            me_base: read_u16(data, 8)?,
            me_limit: read_u16(data, 10)?,
            gbe_base: read_u16(data, 12)?,
            gbe_limit: read_u16(data, 14)?,
            pdr_base: read_u16(data, 16)?,
            pdr_limit: read_u16(data, 18)?,
        })
    }
}

/// FLMSTR: per-master id and access bits.
#[derive(Debug, Clone, Copy, Default)]
struct MasterTable {
    bios_id: u16,
    bios_read: u8,
    bios_write: u8,
    me_id: u16,
    me_read: u8,
    me_write: u8,
    gbe_id: u16,
    gbe_read: u8,
    gbe_write: u8,
}

impl MasterTable {
    fn parse(data: &[u8]) -> Result<MasterTable, Error> {
        Error::check_len(data, 12)?;
        Ok(MasterTable {
            bios_id: read_u16(data, 0)?,
            bios_read: read_u8(data, 2)?,
            bios_write: read_u8(data, 3)?,
            me_id: read_u16(data, 4)?,
            me_read: read_u8(data, 6)?,
            me_write: read_u8(data, 7)?,
            gbe_id: read_u16(data, 8)?,
            gbe_read: read_u8(data, 10)?,
            gbe_write: read_u8(data, 11)?,
        })
    }
}

/// One region of the flash (BIOS, ME, GbE, PDR) with its parsed children.
pub struct FlashRegion {
    name: &'static str,
    data: Vec<u8>,
    base: u16,
    limit: u16,
    id: u16,
    read: u8,
    write: u8,
    children: Vec<Box<dyn FirmwareObject>>,
}

impl FlashRegion {
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl FirmwareObject for FlashRegion {
    fn process(&mut self, ctx: &ParseContext) -> bool {
        self.children.clear();
        match self.name {
            "bios" => {
                let data = self.data.clone();
                self.children = find_volumes(&data, ctx);
                true
            }
            "me" => {
                if MeContainer::match_prefix(&self.data) {
                    if let Ok(mut me) = MeContainer::new(&self.data) {
                        let status = me.process(ctx);
                        self.children.push(Box::new(me));
                        return status;
                    }
                }
                true
            }
            _ => true,
        }
    }

    fn build(&self, _generate_checksum: bool) -> Vec<u8> {
        self.data.clone()
    }

    fn byte_len(&self) -> usize {
        self.data.len()
    }

    fn type_name(&self) -> &'static str {
        "FlashRegion"
    }

    fn objects(&self) -> Vec<&dyn FirmwareObject> {
        self.children.iter().map(|c| c.as_ref() as &dyn FirmwareObject).collect()
    }

    fn label(&self) -> String {
        self.name.to_string()
    }

    fn attrs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("base", format!("{:#x}", self.base)),
            ("limit", format!("{:#x}", self.limit)),
            ("id", format!("{:#x}", self.id)),
            ("read", format!("{:#x}", self.read)),
            ("write", format!("{:#x}", self.write)),
        ]
    }

    fn content(&self) -> &[u8] {
        &self.data
    }

    fn show(&self, out: &mut dyn Write, indent: usize, _index: Option<usize>) -> io::Result<()> {
        writeln!(
            out,
            "{}Flash Region {} size= {:#x} ({} bytes) base= {:#x} limit= {:#x}",
            ts(indent),
            self.name,
            self.data.len(),
            self.data.len(),
            self.base,
            self.limit
        )?;
        for child in &self.children {
            child.show(out, indent + 1, None)?;
        }
        Ok(())
    }

    fn dump(&self, dir: &Path, _index: usize) {
        write_file(&dir.join(format!("region-{}.bin", self.name)), &self.data);
        let child_dir = dir.join(format!("region-{}", self.name));
        for (index, child) in self.children.iter().enumerate() {
            child.dump(&child_dir, index);
        }
    }
}

/// The descriptor itself: tables plus the four regions it describes.
pub struct FlashDescriptor {
    data: Vec<u8>,
    map: DescriptorMap,
    regions: Vec<FlashRegion>,
}

impl FlashDescriptor {
    pub fn match_prefix(prefix: &[u8]) -> bool {
        prefix.len() >= 20 && prefix[16..20] == FLASH_HEADER
    }

    pub fn new(data: &[u8]) -> Result<FlashDescriptor, Error> {
        Error::check_len(data, 20)?;
        if data[16..20] != FLASH_HEADER {
            return Err(Error::InvalidHeader("flash descriptor signature"));
        }
        Ok(FlashDescriptor { data: data.to_vec(), map: DescriptorMap::default(), regions: Vec::new() })
    }

    pub fn map(&self) -> &DescriptorMap {
        &self.map
    }

    pub fn regions(&self) -> &[FlashRegion] {
        &self.regions
    }

    fn region_span(base: u16, limit: u16) -> (usize, usize) {
        let offset = base as usize * 0x1000;
        let size = if limit != 0 { (limit as usize + 1 - base as usize) * 0x1000 } else { 0 };
        (offset, size)
    }
}

impl FirmwareObject for FlashDescriptor {
    fn process(&mut self, ctx: &ParseContext) -> bool {
        self.map = match DescriptorMap::parse(clamped(&self.data, 20, 16)) {
            Ok(map) => map,
            Err(err) => {
                log::warn!("flash descriptor map: {err}");
                return false;
            }
        };
        let region_offset = self.map.region_base as usize * 0x10;
        let region_table = match RegionTable::parse(clamped(&self.data, region_offset, 20)) {
            Ok(table) => table,
            Err(err) => {
                log::warn!("flash region table: {err}");
                return false;
            }
        };
        let master_offset = self.map.master_base as usize * 0x10;
        let master_table = match MasterTable::parse(clamped(&self.data, master_offset, 12)) {
            Ok(table) => table,
            Err(err) => {
                log::warn!("flash master table: {err}");
                return false;
            }
        };

        let specs = [
            ("bios", region_table.bios_base, region_table.bios_limit, master_table.bios_id, master_table.bios_read, master_table.bios_write),
            ("me", region_table.me_base, region_table.me_limit, master_table.me_id, master_table.me_read, master_table.me_write),
            ("gbe", region_table.gbe_base, region_table.gbe_limit, master_table.gbe_id, master_table.gbe_read, master_table.gbe_write),
            ("pdr", region_table.pdr_base, region_table.pdr_limit, 0, 0, 0),
        ];

        let mut status = true;
        self.regions.clear();
        for (name, base, limit, id, read, write) in specs {
            let (offset, size) = Self::region_span(base, limit);
            let mut region = FlashRegion {
                name,
                data: clamped(&self.data, offset, size).to_vec(),
                base,
                limit,
                id,
                read,
                write,
                children: Vec::new(),
            };
            status &= region.process(ctx);
            self.regions.push(region);
        }
        status
    }

    fn build(&self, _generate_checksum: bool) -> Vec<u8> {
        self.data.clone()
    }

    fn byte_len(&self) -> usize {
        self.data.len()
    }

    fn type_name(&self) -> &'static str {
        "FlashDescriptor"
    }

    fn objects(&self) -> Vec<&dyn FirmwareObject> {
        self.regions.iter().map(|r| r as &dyn FirmwareObject).collect()
    }

    fn content(&self) -> &[u8] {
        &self.data
    }

    fn show(&self, out: &mut dyn Write, indent: usize, _index: Option<usize>) -> io::Result<()> {
        writeln!(
            out,
            "{}Flash Descriptor (Intel PCH) chips {}, regions {}, masters {}, PCH straps {}, PROC straps {}",
            ts(indent),
            self.map.number_of_flash_chips,
            self.map.number_of_regions,
            self.map.number_of_masters,
            self.map.number_of_pch_straps,
            self.map.number_of_proc_straps
        )?;
        for region in &self.regions {
            region.show(out, indent + 1, None)?;
        }
        Ok(())
    }

    fn dump(&self, dir: &Path, _index: usize) {
        write_file(&dir.join("flash.fd"), &self.data);
        for (index, region) in self.regions.iter().enumerate() {
            region.dump(dir, index);
        }
    }
}

#[cfg(test)]
mod unit_tests {
    use super::*;
    use crate::fw_fs::volume::test_support::volume;

    /// Build a descriptor: map at +20 pointing the region table at 0x40 and the master
    /// table at 0x60, BIOS region at 0x1000 holding one firmware volume.
    fn descriptor_image() -> Vec<u8> {
        let mut data = vec![0u8; 0x2000];
        data[16..20].copy_from_slice(&FLASH_HEADER);
        data[20] = 0x03; // component base
        data[21] = 1; // one flash chip
        data[22] = 0x04; // region base (*0x10 = 0x40)
        data[23] = 4;
        data[24] = 0x06; // master base (*0x10 = 0x60)
        data[25] = 3;

        // region table @0x40: bios base 1, limit 1 -> offset 0x1000, size 0x1000
        data[0x44..0x46].copy_from_slice(&1u16.to_le_bytes());
        data[0x46..0x48].copy_from_slice(&1u16.to_le_bytes());
        // me/gbe/pdr regions empty (limit 0)

        // master table @0x60
        data[0x60..0x62].copy_from_slice(&0xAAAAu16.to_le_bytes());

        let fv = volume(&[]);
        data[0x1000..0x1000 + fv.len()].copy_from_slice(&fv);
        data
    }

    #[test]
    fn descriptor_regions_and_bios_volume() {
        let image = descriptor_image();
        assert!(FlashDescriptor::match_prefix(&image));

        let mut flash = FlashDescriptor::new(&image).unwrap();
        assert!(flash.process(&ParseContext::default()));
        assert_eq!(flash.regions().len(), 4);
        assert_eq!(flash.regions()[0].name(), "bios");

        let bios_children = flash.regions()[0].objects();
        assert!(bios_children.iter().any(|c| c.type_name() == "FirmwareVolume"));

        // regions are views; descriptor rebuild is byte-identical
        assert_eq!(flash.build(false), image);
    }

    #[test]
    fn wrong_signature_is_rejected() {
        let data = vec![0u8; 64];
        assert!(!FlashDescriptor::match_prefix(&data));
        assert!(matches!(FlashDescriptor::new(&data), Err(Error::InvalidHeader(_))));
    }
}
