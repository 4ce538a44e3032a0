use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use utils::logging;

use crate::config::TopoArgs;
use crate::discovery::PartitionDiscovery;
use crate::platform::sysfs::physical_id;
use crate::platform::Brml;
use crate::platform::DeviceLibrary;
use crate::platform::PciDeviceTree;

/// `card_*` device nodes under `device_dir`, sorted by name.
fn card_nodes(device_dir: &Path) -> Result<Vec<String>> {
    let mut cards = Vec::new();
    for entry in fs::read_dir(device_dir)
        .with_context(|| format!("read dir {} failed", device_dir.display()))?
    {
        let name = entry?.file_name().to_string_lossy().into_owned();
        if name.contains("card_") {
            cards.push(name);
        }
    }
    cards.sort();
    Ok(cards)
}

pub fn run_topo(args: TopoArgs) -> Result<()> {
    let _guard = logging::init(None)?;

    let library: Arc<dyn DeviceLibrary> =
        Arc::new(Brml::load().map_err(|e| anyhow::anyhow!("brml init failed: {e:?}"))?);
    let cards = card_nodes(&args.device_dir)?;
    let discovery = PartitionDiscovery::new(
        library,
        &args.device_dir,
        PciDeviceTree::new(&args.sysfs_pci_path),
        &args.sysfs_class_path,
    );

    let units = discovery
        .discover_units()
        .map_err(|e| anyhow::anyhow!("discover devices failed: {e:?}"))?;
    tracing::info!("discover devices:");
    for unit in &units {
        println!(
            "{} {} mode={} memory={}",
            unit.index, unit.uuid, unit.partition_mode, unit.memory
        );
        for instance in &unit.instances {
            println!(
                "  {} {} {} memory={}",
                instance.card_id, instance.uuid, instance.pool, instance.memory
            );
        }
    }

    discovery
        .build_graph(&cards)
        .map_err(|e| anyhow::anyhow!("device {cards:?} to graph failed: {e:?}"))?;

    tracing::info!("{}/card_x -> gpu hw:", args.device_dir.display());
    for card in &cards {
        match physical_id(&args.sysfs_class_path, card) {
            Ok(id) => println!("{card} -> {id}"),
            Err(e) => tracing::error!("read physical_id of {card} failed: {e}"),
        }
    }
    Ok(())
}
