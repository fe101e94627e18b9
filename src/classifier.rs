//! Tags running tasks as CPU or memory heavy and decides, from the recent
//! resource history, whether they should be parked or may be resumed.

use std::collections::HashSet;

use crate::{
    config::MonitorConfig,
    constants::GIB,
    resource::Usage,
    task::{Mid, TaskKind, TaskSnapshot, TaskStatus},
    utils::SampleWindow,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceClass {
    Cpu,
    Memory,
}

impl std::fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceClass::Cpu => write!(f, "CPU"),
            ResourceClass::Memory => write!(f, "memory"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PressureThresholds {
    pub cpu_high: f32,
    pub cpu_low: f32,
    pub memory_high: f32,
    pub memory_low: f32,
}

impl From<&MonitorConfig> for PressureThresholds {
    fn from(cfg: &MonitorConfig) -> Self {
        Self {
            cpu_high: cfg.cpu_high as f32,
            cpu_low: cfg.cpu_low as f32,
            memory_high: cfg.memory_high as f32,
            memory_low: cfg.memory_low as f32,
        }
    }
}

pub struct ResourceIntensiveClassifier {
    thresholds: PressureThresholds,
    cpu_history: SampleWindow<f32>,
    memory_history: SampleWindow<f32>,
    cpu_intensive: HashSet<Mid>,
    memory_intensive: HashSet<Mid>,
}

impl ResourceIntensiveClassifier {
    pub fn new(thresholds: PressureThresholds, window: usize) -> Self {
        Self {
            thresholds,
            cpu_history: SampleWindow::new(window),
            memory_history: SampleWindow::new(window),
            cpu_intensive: HashSet::new(),
            memory_intensive: HashSet::new(),
        }
    }

    pub fn record(&mut self, usage: Usage) {
        self.cpu_history.push(usage.cpu);
        self.memory_history.push(usage.memory);
    }

    pub fn is_cpu_intensive(snap: &TaskSnapshot) -> bool {
        snap.status.is_processing()
            || (snap.status == TaskStatus::Downloading
                && matches!(snap.kind, TaskKind::Streamrip | TaskKind::Zotify))
            || (snap.status == TaskStatus::Uploading && snap.kind == TaskKind::YoutubeUpload)
    }

    pub fn is_memory_intensive(snap: &TaskSnapshot) -> bool {
        snap.status.is_transfer() && snap.size > GIB
    }

    /// Rebuild both sets from the running tasks. Parked tasks are not
    /// reclassified.
    pub fn rebuild<'a, I>(&mut self, running: I, parked: &HashSet<Mid>)
    where
        I: IntoIterator<Item = &'a TaskSnapshot>,
    {
        self.cpu_intensive.clear();
        self.memory_intensive.clear();
        for snap in running {
            if snap.cancelled || parked.contains(&snap.mid) {
                continue;
            }
            if Self::is_cpu_intensive(snap) {
                self.cpu_intensive.insert(snap.mid);
            }
            if Self::is_memory_intensive(snap) {
                self.memory_intensive.insert(snap.mid);
            }
        }
    }

    /// The class that currently warrants parking `mid`, CPU first.
    pub fn pressure_for(&self, mid: Mid) -> Option<(ResourceClass, String)> {
        [ResourceClass::Cpu, ResourceClass::Memory]
            .into_iter()
            .filter(|&class| self.is_intensive(mid, class))
            .find_map(|class| self.should_queue(class).map(|reason| (class, reason)))
    }

    pub fn is_intensive(&self, mid: Mid, class: ResourceClass) -> bool {
        match class {
            ResourceClass::Cpu => self.cpu_intensive.contains(&mid),
            ResourceClass::Memory => self.memory_intensive.contains(&mid),
        }
    }

    /// Sustained pressure: every sample in a full window above the high mark.
    pub fn should_queue(&self, class: ResourceClass) -> Option<String> {
        let (history, high) = self.history(class, true);
        if !history.full_and_all(|&usage| usage > high) {
            return None;
        }
        let latest = history.latest().copied().unwrap_or_default();
        Some(format!("high {class} usage ({latest:.1}%)"))
    }

    /// Every sample in a full window below the low mark.
    pub fn can_resume(&self, class: ResourceClass) -> bool {
        let (history, low) = self.history(class, false);
        history.full_and_all(|&usage| usage < low)
    }

    fn history(&self, class: ResourceClass, high: bool) -> (&SampleWindow<f32>, f32) {
        let t = &self.thresholds;
        match (class, high) {
            (ResourceClass::Cpu, true) => (&self.cpu_history, t.cpu_high),
            (ResourceClass::Cpu, false) => (&self.cpu_history, t.cpu_low),
            (ResourceClass::Memory, true) => (&self.memory_history, t.memory_high),
            (ResourceClass::Memory, false) => (&self.memory_history, t.memory_low),
        }
    }
}
