//! Human-readable explanations of why loadpoints are not charging at the
//! expected power

use crate::loadpoint::LoadpointRef;
use serde::Serialize;
use std::collections::BTreeMap;

/// Reasons gathered during one control tick
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReasonCollector {
    global: Vec<String>,
    per_loadpoint: BTreeMap<LoadpointRef, Vec<String>>,
}

/// Serializable view of the reasons for one loadpoint
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadpointReasons {
    pub loadpoint: LoadpointRef,
    pub reasons: Vec<String>,
}

impl ReasonCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reason affecting every loadpoint, e.g. a constrained power budget
    pub fn add_global(&mut self, reason: impl Into<String>) {
        self.global.push(reason.into());
    }

    pub fn add(&mut self, loadpoint: LoadpointRef, reason: impl Into<String>) {
        self.per_loadpoint
            .entry(loadpoint)
            .or_default()
            .push(reason.into());
    }

    pub fn global(&self) -> &[String] {
        &self.global
    }

    pub fn for_loadpoint(&self, loadpoint: LoadpointRef) -> &[String] {
        self.per_loadpoint
            .get(&loadpoint)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn entries(&self) -> Vec<LoadpointReasons> {
        self.per_loadpoint
            .iter()
            .map(|(loadpoint, reasons)| LoadpointReasons {
                loadpoint: *loadpoint,
                reasons: reasons.clone(),
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.global.is_empty() && self.per_loadpoint.is_empty()
    }
}
