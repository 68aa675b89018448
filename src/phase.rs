//! Phase demarcation
//!
//! A phase is a named logical stage of the traced program (map, reduce, merge, ...)
//! identified by the routine that starts it. Each time one of those routines is
//! entered, one textual marker goes into the trace through the encoder.
//!
//! No transition validation is done. Phases may repeat, be skipped, or arrive out of
//! the expected order; the markers mirror whatever the program actually calls.

use crate::encoder::EventEncoder;
use crate::error::{Result, TraceError};
use crate::symbols::SymbolLookup;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

/// One configured phase: marker name and the routine whose entry starts it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseSpec {
    pub name: String,
    pub routine: String,
}

impl PhaseSpec {
    pub fn new(name: impl Into<String>, routine: impl Into<String>) -> Self {
        PhaseSpec {
            name: name.into(),
            routine: routine.into(),
        }
    }

    /// A phase started by a routine of the same name
    pub fn named(name: impl Into<String>) -> Self {
        let name = name.into();
        PhaseSpec {
            routine: name.clone(),
            name,
        }
    }
}

/// Phases recognised out of the box (MapReduce- and graph-framework entry points)
pub fn default_phases() -> Vec<PhaseSpec> {
    [
        "map",
        "reduce",
        "merge",
        "start_thread_pool",
        "edgeMap",
        "vertexMap",
    ]
    .into_iter()
    .map(PhaseSpec::named)
    .collect()
}

/// Ordered, read-only list of phases fixed at startup
#[derive(Debug, Clone, Default)]
pub struct PhaseTable {
    phases: Vec<PhaseSpec>,
}

impl PhaseTable {
    /// Validate names: non-empty and single-line so markers stay decodable
    pub fn new(phases: Vec<PhaseSpec>) -> Result<Self> {
        for phase in &phases {
            if phase.name.is_empty() || phase.routine.is_empty() {
                return Err(TraceError::Config(format!(
                    "phase {:?} needs a non-empty name and routine",
                    phase
                )));
            }
            if phase.name.contains('\n') {
                return Err(TraceError::Config(format!(
                    "phase name {:?} contains a newline",
                    phase.name
                )));
            }
        }
        Ok(PhaseTable { phases })
    }

    pub fn get(&self, index: usize) -> Option<&PhaseSpec> {
        self.phases.get(index)
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PhaseSpec> {
        self.phases.iter()
    }
}

/// A phase routine found in a loaded image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedPhase {
    pub phase_index: usize,
    pub address: u64,
}

/// Maps routine entries to phase markers
pub struct PhaseTracker {
    table: PhaseTable,
    by_address: RwLock<HashMap<u64, usize>>,
}

impl PhaseTracker {
    pub fn new(table: PhaseTable) -> Self {
        PhaseTracker {
            table,
            by_address: RwLock::new(HashMap::new()),
        }
    }

    pub fn table(&self) -> &PhaseTable {
        &self.table
    }

    /// Bind every phase routine present in `image`; returns what was found
    pub fn resolve_image(&self, image: &dyn SymbolLookup) -> Vec<ResolvedPhase> {
        let resolved: Vec<ResolvedPhase> = self
            .table
            .iter()
            .enumerate()
            .filter_map(|(phase_index, phase)| {
                image
                    .find_routine(&phase.routine)
                    .map(|address| ResolvedPhase {
                        phase_index,
                        address,
                    })
            })
            .collect();

        let mut by_address = self
            .by_address
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for phase in &resolved {
            by_address.insert(phase.address, phase.phase_index);
            tracing::debug!(
                phase = %self.table.phases[phase.phase_index].name,
                address = format_args!("{:#x}", phase.address),
                "phase routine bound"
            );
        }
        resolved
    }

    /// Emit the marker for phase `phase_index`; unknown indices are ignored
    pub fn enter_phase(&self, phase_index: usize, encoder: &EventEncoder) -> bool {
        match self.table.get(phase_index) {
            Some(phase) => {
                encoder.record_phase(&phase.name);
                true
            }
            None => false,
        }
    }

    /// Routine-entry callback: emit a marker if `routine_address` starts a phase
    pub fn on_routine_entry(&self, routine_address: u64, encoder: &EventEncoder) -> Option<usize> {
        let index = self
            .by_address
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&routine_address)
            .copied()?;
        self.enter_phase(index, encoder);
        Some(index)
    }
}
