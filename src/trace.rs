//! Structured per-instruction execution trace.
//!
//! Executors emit one [`TraceRecord`] per retired (or faulted) instruction;
//! the debugger filters records against the active [`TraceOptions`] and
//! renders them with the installed formatter. The three trace categories are
//! independently selectable, so a record is emitted iff at least one enabled
//! category has something to say about it.

use std::fmt::Write as _;

use crate::cpu::AccessKind;

/// Independently selectable trace categories.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TraceOptions {
    /// Log every retired instruction.
    pub log_instruction: bool,
    /// Log data-side memory events (fetches are collected but not printed).
    pub log_mem_events: bool,
    /// Log branch outcome and prediction details.
    pub log_branch_prediction: bool,
}

impl TraceOptions {
    pub fn any(&self) -> bool {
        self.log_instruction || self.log_mem_events || self.log_branch_prediction
    }
}

/// One bus transaction observed while executing an instruction.
#[derive(Debug, Clone, Copy)]
pub struct MemAccessEvent {
    pub kind: AccessKind,
    pub address: u64,
    pub size: u32,
    pub data: u64,
    pub latency_cycles: u32,
}

/// Branch outcome and what the predictor thought would happen.
#[derive(Debug, Clone, Copy, Default)]
pub struct BranchDetails {
    pub taken: bool,
    pub target: u64,
    pub predicted_taken: bool,
    pub predicted_target: u64,
}

/// Structured record of a single instruction's execution window.
#[derive(Debug, Clone, Default)]
pub struct TraceRecord {
    pub pc: u64,
    pub inst: u32,
    pub decoded: String,
    pub cycle_begin: u64,
    pub cycle_end: u64,
    pub mem_events: Vec<MemAccessEvent>,
    pub is_branch: bool,
    pub branch: BranchDetails,
    /// Free-form key/value annotations, e.g. from [`append_metrics`].
    pub extra: Vec<(String, String)>,
}

impl TraceRecord {
    /// True when at least one recorded event is a data-side access.
    pub fn has_data_events(&self) -> bool {
        self.mem_events.iter().any(|e| e.kind != AccessKind::Fetch)
    }
}

/// Renders a record into one log line.
pub type TraceFormatter = Box<dyn Fn(&TraceRecord, &TraceOptions) -> String + Send + Sync>;

/// Filter rule: emit iff any enabled category yields data for this record.
pub fn should_emit(record: &TraceRecord, options: &TraceOptions) -> bool {
    if options.log_branch_prediction && record.is_branch {
        return true;
    }
    if options.log_instruction {
        return true;
    }
    if options.log_mem_events && record.has_data_events() {
        return true;
    }
    false
}

/// Default line format.
///
/// `PC:0x… Inst:0x… (mnemonic)` when instruction logging is on,
/// `BP:(T:… P:… Target:0x… PTarget:0x…)` for branches when branch logging is
/// on, and `Mem:[K:0x…=0x…, …]` (fetches excluded) when memory logging is on.
pub fn default_format(record: &TraceRecord, options: &TraceOptions) -> String {
    let mut line = String::new();
    if options.log_instruction {
        let _ = write!(line, "PC:0x{:08x} Inst:0x{:08x} ({})", record.pc, record.inst, record.decoded);
    }
    if options.log_branch_prediction && record.is_branch {
        if !line.is_empty() {
            line.push(' ');
        }
        let _ = write!(
            line,
            "BP:(T:{} P:{} Target:0x{:x} PTarget:0x{:x})",
            record.branch.taken as u32,
            record.branch.predicted_taken as u32,
            record.branch.target,
            record.branch.predicted_target,
        );
    }
    if options.log_mem_events && record.has_data_events() {
        if !line.is_empty() {
            line.push(' ');
        }
        line.push_str("Mem:[");
        let mut first = true;
        for event in record.mem_events.iter().filter(|e| e.kind != AccessKind::Fetch) {
            if !first {
                line.push_str(", ");
            }
            first = false;
            let _ = write!(line, "{}:0x{:x}=0x{:x}", event.kind, event.address, event.data);
        }
        line.push(']');
    }
    line
}

/// Attaches aggregate metrics to a record's extra fields: total memory
/// latency and per-kind access counts.
pub fn append_metrics(record: &mut TraceRecord) {
    let latency: u64 = record.mem_events.iter().map(|e| u64::from(e.latency_cycles)).sum();
    let count = |kind: AccessKind| record.mem_events.iter().filter(|e| e.kind == kind).count();
    let reads = count(AccessKind::Read);
    let writes = count(AccessKind::Write);
    let fetches = count(AccessKind::Fetch);
    record.extra.push(("mem_latency".into(), latency.to_string()));
    record.extra.push(("mem_reads".into(), reads.to_string()));
    record.extra.push(("mem_writes".into(), writes.to_string()));
    record.extra.push(("mem_fetches".into(), fetches.to_string()));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_event(address: u64, data: u64) -> MemAccessEvent {
        MemAccessEvent { kind: AccessKind::Read, address, size: 4, data, latency_cycles: 0 }
    }

    fn fetch_event(address: u64) -> MemAccessEvent {
        MemAccessEvent { kind: AccessKind::Fetch, address, size: 4, data: 0, latency_cycles: 0 }
    }

    #[test]
    fn filter_requires_an_enabled_category_with_data() {
        let mut record = TraceRecord::default();
        let off = TraceOptions::default();
        assert!(!should_emit(&record, &off));

        let itrace = TraceOptions { log_instruction: true, ..Default::default() };
        assert!(should_emit(&record, &itrace));

        // A fetch alone does not satisfy the memory category.
        let mtrace = TraceOptions { log_mem_events: true, ..Default::default() };
        record.mem_events.push(fetch_event(0));
        assert!(!should_emit(&record, &mtrace));
        record.mem_events.push(read_event(0x100, 7));
        assert!(should_emit(&record, &mtrace));

        let bptrace = TraceOptions { log_branch_prediction: true, ..Default::default() };
        assert!(!should_emit(&TraceRecord::default(), &bptrace));
        let branch = TraceRecord { is_branch: true, ..Default::default() };
        assert!(should_emit(&branch, &bptrace));
    }

    #[test]
    fn default_format_sections_follow_options() {
        let record = TraceRecord {
            pc: 0x40,
            inst: 0x0501_0201,
            decoded: "BEQ r1, r2, 1".into(),
            is_branch: true,
            branch: BranchDetails { taken: true, target: 0x48, predicted_taken: false, predicted_target: 0x44 },
            mem_events: vec![fetch_event(0x40), read_event(0x8000_0000, 0x11223344)],
            ..Default::default()
        };

        let all = TraceOptions { log_instruction: true, log_mem_events: true, log_branch_prediction: true };
        let line = default_format(&record, &all);
        assert!(line.contains("PC:0x00000040"), "{line}");
        assert!(line.contains("(BEQ r1, r2"), "{line}");
        assert!(line.contains("BP:(T:1 P:0 Target:0x48"), "{line}");
        assert!(line.contains("Mem:[R:0x80000000=0x11223344]"), "{line}");

        // Fetch events never show in the Mem section.
        assert!(!line.contains("F:0x40"), "{line}");

        let itrace_only = TraceOptions { log_instruction: true, ..Default::default() };
        let line = default_format(&record, &itrace_only);
        assert!(!line.contains("BP:("), "{line}");
        assert!(!line.contains("Mem:["), "{line}");
    }

    #[test]
    fn metrics_count_events_by_kind() {
        let mut record = TraceRecord {
            mem_events: vec![fetch_event(0), read_event(8, 1), read_event(16, 2)],
            ..Default::default()
        };
        append_metrics(&mut record);
        let lookup = |key: &str| {
            record
                .extra
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
                .unwrap_or_default()
        };
        assert_eq!(lookup("mem_reads"), "2");
        assert_eq!(lookup("mem_writes"), "0");
        assert_eq!(lookup("mem_fetches"), "1");
        assert_eq!(lookup("mem_latency"), "0");
    }
}
