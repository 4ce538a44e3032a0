//! In-memory management library used by tests.

use std::collections::HashMap;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use error_stack::Report;

use super::brml::BrmlError;
use super::brml::DeviceLibrary;

#[derive(Debug, Clone)]
pub struct FakeCard {
    pub uuid: String,
    pub partition_mode: u32,
    pub memory: u64,
    pub node_ids: Vec<u32>,
    pub bus_id: String,
}

/// Fake accelerator inventory. Cards are numbered in insertion order and
/// node ids are handed out sequentially, one per exposed instance.
#[derive(Debug, Default)]
pub struct FakeLibrary {
    cards: Vec<FakeCard>,
    links: HashMap<(u32, u32), u32>,
    default_link: u32,
    failing_index: Option<u32>,
    visible_count: Option<AtomicU32>,
}

const FAKE_MEMORY: u64 = 32 << 30;

impl FakeLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_card(mut self, partition_mode: u32) -> Self {
        let index = self.cards.len() as u32;
        let next_node = self.cards.iter().map(|c| c.node_ids.len() as u32).sum::<u32>();
        let instances = partition_mode.max(1);
        self.cards.push(FakeCard {
            uuid: format!("BR-{index:04}"),
            partition_mode,
            memory: FAKE_MEMORY,
            node_ids: (next_node..next_node + instances).collect(),
            bus_id: format!("00000000:{:02X}:00.0", index + 0x3b),
        });
        self
    }

    pub fn with_link(mut self, node_a: u32, node_b: u32, class: u32) -> Self {
        self.links.insert((node_a, node_b), class);
        self.links.insert((node_b, node_a), class);
        self
    }

    pub fn with_default_link(mut self, class: u32) -> Self {
        self.default_link = class;
        self
    }

    /// Makes every query against physical device `index` fail.
    pub fn failing_at(mut self, index: u32) -> Self {
        self.failing_index = Some(index);
        self
    }

    /// Lets a test simulate devices disappearing from the host.
    pub fn with_adjustable_count(mut self) -> Self {
        self.visible_count = Some(AtomicU32::new(self.cards.len() as u32));
        self
    }

    pub fn set_visible_count(&self, count: u32) {
        if let Some(visible) = &self.visible_count {
            visible.store(count, Ordering::SeqCst);
        }
    }

    fn card(&self, index: u32) -> Result<&FakeCard, Report<BrmlError>> {
        if self.failing_index == Some(index) {
            return Err(Report::new(BrmlError::Call {
                function: "fake",
                code: 999,
            }));
        }
        self.cards.get(index as usize).ok_or_else(|| {
            Report::new(BrmlError::Call {
                function: "fake",
                code: 2,
            })
        })
    }
}

impl DeviceLibrary for FakeLibrary {
    fn device_count(&self) -> Result<u32, Report<BrmlError>> {
        Ok(match &self.visible_count {
            Some(visible) => visible.load(Ordering::SeqCst),
            None => self.cards.len() as u32,
        })
    }

    fn partition_mode(&self, index: u32) -> Result<u32, Report<BrmlError>> {
        Ok(self.card(index)?.partition_mode)
    }

    fn device_uuid(&self, index: u32) -> Result<String, Report<BrmlError>> {
        Ok(self.card(index)?.uuid.clone())
    }

    fn memory_total(&self, index: u32) -> Result<u64, Report<BrmlError>> {
        Ok(self.card(index)?.memory)
    }

    fn node_id(&self, index: u32) -> Result<u32, Report<BrmlError>> {
        Ok(self.card(index)?.node_ids[0])
    }

    fn instance_node_id(&self, index: u32, instance: u32) -> Result<u32, Report<BrmlError>> {
        let card = self.card(index)?;
        card.node_ids.get(instance as usize).copied().ok_or_else(|| {
            Report::new(BrmlError::Call {
                function: "fake",
                code: 2,
            })
        })
    }

    fn instance_memory_total(&self, index: u32, _instance: u32) -> Result<u64, Report<BrmlError>> {
        let card = self.card(index)?;
        Ok(card.memory / card.partition_mode.max(1) as u64)
    }

    fn pci_bus_id(&self, index: u32) -> Result<String, Report<BrmlError>> {
        Ok(self.card(index)?.bus_id.clone())
    }

    fn link_class(&self, node_a: u32, node_b: u32) -> Result<u32, Report<BrmlError>> {
        Ok(self
            .links
            .get(&(node_a, node_b))
            .copied()
            .unwrap_or(self.default_link))
    }

    fn library_version(&self) -> Result<String, Report<BrmlError>> {
        Ok("1.2.0".to_string())
    }
}
