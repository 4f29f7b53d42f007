//! Volume code validation
//!
//! A driver scans (or types) the ETI code of every volume before a B2B leg
//! can be finalized. Matching is case-insensitive and tolerates partial scans:
//! a submission is accepted when it equals, is contained in, or contains a
//! required code. Each required code can be satisfied once.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;

use crate::domain::{B2bPhase, B2bShipmentId, B2bVolume};
use crate::infra::{LogisticsError, Result};

use super::EvidenceFile;

/// Placeholder code for a volume whose label has not been persisted yet
pub fn fallback_code(sequence: u32) -> String {
    format!("ETI-{sequence:04}")
}

/// Placeholder codes `ETI-0001 ..= ETI-{count}`
pub fn fallback_eti_codes(count: usize) -> Vec<String> {
    (1..=count as u32).map(fallback_code).collect()
}

/// Required codes for a set of volumes: the persisted label code, or the
/// sequence-based placeholder when none was persisted.
pub fn required_codes_for(volumes: &[B2bVolume]) -> Vec<String> {
    volumes
        .iter()
        .map(|v| {
            v.eti_code
                .clone()
                .unwrap_or_else(|| fallback_code(v.sequence))
        })
        .collect()
}

fn normalize(code: &str) -> String {
    code.trim().to_lowercase()
}

/// Delivered to the completion callback when the last code is accepted
#[derive(Debug, Clone)]
pub struct Completion {
    /// Submissions that satisfied the required codes, in scan order
    pub codes: Vec<String>,
    /// Photo sent together with the completing scan
    pub photo: Option<EvidenceFile>,
}

pub type CompletionCallback = Box<dyn FnOnce(Completion) + Send + Sync>;

/// Result of an accepted scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanAccepted {
    /// Required code the submission satisfied
    pub matched: String,
    pub scanned: usize,
    pub required: usize,
    pub complete: bool,
}

#[derive(Debug, Clone)]
struct RequiredCode {
    display: String,
    normalized: String,
    satisfied: bool,
}

impl RequiredCode {
    fn matches(&self, submission: &str) -> bool {
        self.normalized == submission
            || self.normalized.contains(submission)
            || submission.contains(self.normalized.as_str())
    }
}

/// Validator for one shipment leg
pub struct CodeValidator {
    required: Vec<RequiredCode>,
    scanned: Vec<String>,
    on_complete: Option<CompletionCallback>,
}

impl CodeValidator {
    pub fn new<I, S>(required: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let required = required
            .into_iter()
            .map(|code| {
                let display = code.into();
                RequiredCode {
                    normalized: normalize(&display),
                    display,
                    satisfied: false,
                }
            })
            .collect();
        Self {
            required,
            scanned: Vec::new(),
            on_complete: None,
        }
    }

    /// Register the callback fired when validation completes. It fires at
    /// most once per validator.
    pub fn on_complete(mut self, callback: CompletionCallback) -> Self {
        self.on_complete = Some(callback);
        self
    }

    pub fn scan(&mut self, code: &str) -> Result<ScanAccepted> {
        self.scan_with_photo(code, None)
    }

    /// Submit a code, optionally with a photo handed to the completion callback
    pub fn scan_with_photo(
        &mut self,
        code: &str,
        photo: Option<EvidenceFile>,
    ) -> Result<ScanAccepted> {
        let submission = normalize(code);
        if submission.is_empty() {
            return Err(LogisticsError::InvalidInput("empty code".to_string()));
        }
        if self.scanned.contains(&submission) {
            return Err(LogisticsError::DuplicateCode(code.trim().to_string()));
        }

        // Exact matches win over containment so a short code cannot steal
        // the slot of a longer one that it happens to be part of.
        let slot = self
            .required
            .iter()
            .position(|r| !r.satisfied && r.normalized == submission)
            .or_else(|| {
                self.required
                    .iter()
                    .position(|r| !r.satisfied && r.matches(&submission))
            });

        let Some(slot) = slot else {
            if self.required.iter().any(|r| r.matches(&submission)) {
                return Err(LogisticsError::DuplicateCode(code.trim().to_string()));
            }
            return Err(LogisticsError::UnknownCode(code.trim().to_string()));
        };

        self.required[slot].satisfied = true;
        self.scanned.push(submission);
        let accepted = ScanAccepted {
            matched: self.required[slot].display.clone(),
            scanned: self.scanned_count(),
            required: self.required_count(),
            complete: self.is_complete(),
        };

        if accepted.complete {
            if let Some(callback) = self.on_complete.take() {
                callback(Completion {
                    codes: self.scanned.clone(),
                    photo,
                });
            }
        }
        Ok(accepted)
    }

    pub fn required_count(&self) -> usize {
        self.required.len()
    }

    pub fn scanned_count(&self) -> usize {
        self.scanned.len()
    }

    pub fn is_complete(&self) -> bool {
        self.required.iter().all(|r| r.satisfied)
    }

    fn same_requirements(&self, codes: &[String]) -> bool {
        self.required.len() == codes.len()
            && self
                .required
                .iter()
                .zip(codes)
                .all(|(r, code)| r.display == *code)
    }

    fn status(&self, phase: B2bPhase) -> ValidationStatus {
        ValidationStatus {
            phase,
            required: self.required.iter().map(|r| r.display.clone()).collect(),
            validated: self
                .required
                .iter()
                .filter(|r| r.satisfied)
                .map(|r| r.display.clone())
                .collect(),
            pending: self
                .required
                .iter()
                .filter(|r| !r.satisfied)
                .map(|r| r.display.clone())
                .collect(),
            complete: self.is_complete(),
        }
    }
}

/// Snapshot of one leg's validation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationStatus {
    pub phase: B2bPhase,
    pub required: Vec<String>,
    pub validated: Vec<String>,
    pub pending: Vec<String>,
    pub complete: bool,
}

impl ValidationStatus {
    pub fn scanned(&self) -> usize {
        self.validated.len()
    }
}

/// Called once per leg when its last code is accepted
pub type CompletionHook = Arc<dyn Fn(B2bShipmentId, B2bPhase, &Completion) + Send + Sync>;

struct Entry {
    validator: CodeValidator,
    photo: Arc<std::sync::Mutex<Option<EvidenceFile>>>,
}

/// Validators of every shipment leg currently being worked on
#[derive(Default)]
pub struct ValidationRegistry {
    entries: Mutex<HashMap<(B2bShipmentId, B2bPhase), Entry>>,
    hook: Option<CompletionHook>,
}

impl ValidationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hook(hook: CompletionHook) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            hook: Some(hook),
        }
    }

    fn new_entry(&self, id: B2bShipmentId, phase: B2bPhase, required: &[String]) -> Entry {
        let photo = Arc::new(std::sync::Mutex::new(None));
        let slot = photo.clone();
        let hook = self.hook.clone();
        let callback: CompletionCallback = Box::new(move |completion: Completion| {
            if let Some(hook) = hook {
                hook(id, phase, &completion);
            }
            if let Some(file) = completion.photo {
                let mut slot = slot.lock().unwrap_or_else(|e| e.into_inner());
                *slot = Some(file);
            }
        });
        Entry {
            validator: CodeValidator::new(required.iter().cloned()).on_complete(callback),
            photo,
        }
    }

    /// Scan a code for a leg. The entry is (re)built when the required codes
    /// differ from the ones it was created with.
    pub async fn scan(
        &self,
        id: B2bShipmentId,
        phase: B2bPhase,
        required: &[String],
        code: &str,
        photo: Option<EvidenceFile>,
    ) -> Result<ScanAccepted> {
        let mut entries = self.entries.lock().await;
        let stale = entries
            .get(&(id, phase))
            .is_some_and(|e| !e.validator.same_requirements(required));
        if stale {
            entries.remove(&(id, phase));
        }
        let entry = entries
            .entry((id, phase))
            .or_insert_with(|| self.new_entry(id, phase, required));
        entry.validator.scan_with_photo(code, photo)
    }

    pub async fn status(
        &self,
        id: B2bShipmentId,
        phase: B2bPhase,
        required: &[String],
    ) -> ValidationStatus {
        let entries = self.entries.lock().await;
        match entries.get(&(id, phase)) {
            Some(entry) if entry.validator.same_requirements(required) => {
                entry.validator.status(phase)
            }
            _ => CodeValidator::new(required.iter().cloned()).status(phase),
        }
    }

    /// Photo attached to the completing scan, if any
    pub async fn completion_photo(&self, id: B2bShipmentId, phase: B2bPhase) -> Option<EvidenceFile> {
        let entries = self.entries.lock().await;
        let entry = entries.get(&(id, phase))?;
        let photo = entry.photo.lock().unwrap_or_else(|e| e.into_inner());
        photo.clone()
    }

    /// Drop the leg's validator after it has been finalized
    pub async fn reset(&self, id: B2bShipmentId, phase: B2bPhase) {
        self.entries.lock().await.remove(&(id, phase));
    }

    /// Keep only the validator of the leg being worked, and only while its
    /// required codes are unchanged
    pub async fn prune(&self, id: B2bShipmentId, worked: Option<B2bPhase>, required: &[String]) {
        let mut entries = self.entries.lock().await;
        entries.retain(|(entry_id, phase), entry| {
            *entry_id != id
                || (worked == Some(*phase)
                    && !required.is_empty()
                    && entry.validator.same_requirements(required))
        });
    }

    /// Drop every validator of a shipment
    pub async fn evict(&self, id: B2bShipmentId) {
        self.prune(id, None, &[]).await;
    }

    /// Number of legs with a live validator
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
