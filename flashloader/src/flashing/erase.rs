use flashloader_target::{MemoryRange, NvmRegion};

use super::flasher::{ErasePlan, Flasher};
use super::{FlashAlgorithm, FlashError, FlashProgress, FlashSector, FlashTimeouts};
use crate::session::Session;

/// The flash regions of the target, grouped by the algorithm that erases them.
fn algorithms_with_regions(
    session: &Session,
) -> Result<Vec<(FlashAlgorithm, Vec<NvmRegion>)>, FlashError> {
    let target = session.target();
    let mut algos: Vec<(FlashAlgorithm, Vec<NvmRegion>)> = Vec::new();

    tracing::debug!("Regions:");
    for region in target.memory_map.nvm_regions() {
        tracing::debug!(
            "    region: {:#010x?} ({} bytes)",
            region.range,
            region.range.end - region.range.start
        );

        let raw = target.flash_algorithm_for_region(region)?;
        tracing::debug!("     -- using algorithm: {}", raw.name);

        if let Some((_, regions)) = algos.iter_mut().find(|(algo, _)| algo.name == raw.name) {
            regions.push(region.clone());
        } else {
            let algo =
                FlashAlgorithm::assemble_from_raw(raw, &target.memory_map, target.instruction_set)?;
            algos.push((algo, vec![region.clone()]));
        }
    }

    Ok(algos)
}

/// The sectors of `algo` that lie in one of `regions`.
fn sectors_in_regions<'a>(
    algo: &'a FlashAlgorithm,
    regions: &'a [NvmRegion],
) -> impl Iterator<Item = FlashSector> + 'a {
    algo.iter_sectors()
        .filter(|info| {
            let range = info.address_range();
            regions.iter().any(|r| r.range.contains_range(&range))
        })
        .map(FlashSector::from)
}

/// Mass-erase all nonvolatile memory.
///
/// Flash algorithms with an erase all routine erase their flash with a single call,
/// all others erase sector by sector. Every routine call is bounded by `timeouts`.
pub fn erase_all(
    session: &mut Session,
    progress: FlashProgress,
    timeouts: FlashTimeouts,
) -> Result<(), FlashError> {
    tracing::debug!("Erasing all...");

    for (algo, regions) in algorithms_with_regions(session)? {
        tracing::debug!("Erasing with algorithm: {}", algo.name);

        let plan = if algo.pc_erase_all.is_some() {
            tracing::debug!("     -- chip erase supported, doing it.");
            ErasePlan::Chip
        } else {
            tracing::debug!("     -- chip erase not supported, erasing by sector.");
            ErasePlan::Sectors(sectors_in_regions(&algo, &regions).collect())
        };

        Flasher::new(
            session.access(),
            algo,
            timeouts,
            progress.clone(),
        )
        .run_erase(&plan, false)?;
    }

    Ok(())
}

/// Erases `count` sectors starting from `start_sector` from flash.
///
/// Sectors are counted per flash algorithm, starting at the first sector of its flash.
pub fn erase_sectors(
    session: &mut Session,
    progress: FlashProgress,
    timeouts: FlashTimeouts,
    start_sector: usize,
    count: usize,
) -> Result<(), FlashError> {
    tracing::debug!(
        "Erasing sectors {start_sector} through {}",
        start_sector + count
    );

    for (algo, regions) in algorithms_with_regions(session)? {
        tracing::debug!("Erasing with algorithm: {}", algo.name);

        let sectors: Vec<FlashSector> = algo
            .iter_sectors()
            .skip(start_sector)
            .take(count)
            .filter(|info| {
                let range = info.address_range();
                regions.iter().any(|r| r.range.contains_range(&range))
            })
            .map(FlashSector::from)
            .collect();

        if sectors.is_empty() {
            continue;
        }

        for sector in &sectors {
            tracing::debug!(
                "    sector: {:#010x}-{:#010x} ({} bytes)",
                sector.address(),
                sector.address() + sector.size(),
                sector.size()
            );
        }

        Flasher::new(
            session.access(),
            algo,
            timeouts,
            progress.clone(),
        )
        .run_erase(&ErasePlan::Sectors(sectors), false)?;
    }

    Ok(())
}
