//! [`crate::BootInformation`] implemented over the real `multiboot2` crate,
//! which parses the tag list format described in §6.

use crate::{MemoryAreaType, PhysicalAddressRange};
use log::warn;
use memory_structs::PhysicalAddress;
use multiboot2::{BootInformation as Mb2BootInformation, MemoryAreaType as Mb2AreaType};

impl crate::MemoryArea for multiboot2::MemoryArea {
    fn start(&self) -> PhysicalAddress {
        PhysicalAddress::new_canonical(self.start_address() as usize)
    }

    fn len(&self) -> usize {
        self.size() as usize
    }

    fn area_type(&self) -> MemoryAreaType {
        match self.typ() {
            Mb2AreaType::Available => MemoryAreaType::Available,
            Mb2AreaType::Reserved => MemoryAreaType::Reserved,
            Mb2AreaType::AcpiAvailable => MemoryAreaType::AcpiReclaimable,
            Mb2AreaType::ReservedHibernate => MemoryAreaType::AcpiNvs,
            Mb2AreaType::Defective => MemoryAreaType::Bad,
            _ => MemoryAreaType::Reserved,
        }
    }
}

impl crate::BootInformation for Mb2BootInformation {
    fn size(&self) -> usize {
        self.total_size()
    }

    fn kernel_extent(&self) -> Result<PhysicalAddressRange, &'static str> {
        let elf_sections = self
            .elf_sections()
            .ok_or("boot_info: missing ELF sections tag")?;

        let mut start: Option<u64> = None;
        let mut end: Option<u64> = None;
        for section in elf_sections {
            if section.size() == 0 {
                continue;
            }
            let section_start = section.start_address();
            let section_end = section.end_address();
            start = Some(start.map_or(section_start, |s| s.min(section_start)));
            end = Some(end.map_or(section_end, |e| e.max(section_end)));
        }

        match (start, end) {
            (Some(start), Some(end)) => Ok(PhysicalAddressRange {
                start: PhysicalAddress::new_canonical(start as usize),
                end: PhysicalAddress::new_canonical(end as usize),
            }),
            _ => {
                warn!("boot_info: no allocated ELF sections found");
                Err("boot_info: no allocated ELF sections found")
            }
        }
    }

    fn boot_info_extent(&self) -> Result<PhysicalAddressRange, &'static str> {
        let start = self.start_address();
        let end = self.end_address();
        Ok(PhysicalAddressRange {
            start: PhysicalAddress::new_canonical(start),
            end: PhysicalAddress::new_canonical(end),
        })
    }

    fn for_each_memory_area(&self, f: &mut dyn FnMut(&dyn crate::MemoryArea)) -> Result<(), &'static str> {
        let tag = self
            .memory_map_tag()
            .ok_or("boot_info: missing memory map tag")?;
        for area in tag.memory_areas() {
            f(area);
        }
        Ok(())
    }
}

/// Loads the multiboot2 tag list at the given physical address.
///
/// # Safety
/// `multiboot_info_ptr` must be the untouched, physically-addressed pointer
/// that the bootloader placed in `%rbx` on kernel entry.
pub unsafe fn load(multiboot_info_ptr: usize) -> Result<Mb2BootInformation, &'static str> {
    multiboot2::load(multiboot_info_ptr).map_err(|_| "boot_info: failed to parse multiboot2 tag list")
}
