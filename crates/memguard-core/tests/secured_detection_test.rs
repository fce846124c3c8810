//! Corruption and misuse detection in secured mode.

use memguard_core::secured::block::HEADER_SIZE;
use memguard_core::{AllocatorConfig, BackendKind, DiagLevel, MemAllocator, ReportSink};

fn secured() -> MemAllocator {
    MemAllocator::with_config(
        AllocatorConfig::default()
            .with_backend(BackendKind::Secured)
            .with_report_sink(ReportSink::Silent),
    )
}

fn events(alloc: &MemAllocator) -> Vec<&'static str> {
    alloc.diagnostics().iter().map(|r| r.event).collect()
}

#[test]
fn double_free_is_detected_and_others_stay_healthy() {
    let alloc = secured();
    let keep: Vec<_> = (0..4).map(|i| alloc.malloc(16 + i, "keep")).collect();
    let p = alloc.malloc(32, "twice");
    unsafe {
        alloc.free(p);
        alloc.free(p);
    }
    let records = alloc.diagnostics();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].event, "double_free");
    assert_eq!(records[0].level, DiagLevel::Error);
    assert!(records[0].message.contains("already freed"));

    assert_eq!(alloc.get_totblock(), 4);
    assert!(alloc.check_memory());
    for k in keep {
        unsafe { alloc.free(k) };
    }
    assert_eq!(alloc.get_totblock(), 0);
}

#[test]
fn tail_overrun_is_caught_by_check_memory_then_free() {
    let alloc = secured();
    let a = alloc.malloc(10, "before");
    let p = alloc.malloc(10, "overrun");
    let c = alloc.malloc(10, "after");

    // One byte past the requested length.
    unsafe { p.add(10).write(0) };
    assert!(!alloc.check_memory());
    assert!(events(&alloc).contains(&"tail_corruption"));

    unsafe { alloc.free(p) };
    let last = alloc.diagnostics().into_iter().rev().find(|r| r.op == "free");
    let last = last.expect("free reported the overrun");
    assert_eq!(last.event, "tail_corruption");
    assert_eq!(last.block, Some("overrun"));
    assert!(last.message.contains("end corrupt"));

    // Fully unlinked: counters settled and the remaining blocks check out.
    assert_eq!(alloc.get_totblock(), 2);
    assert_eq!(alloc.get_mem_in_use(), 20);
    assert!(alloc.check_memory());
    unsafe {
        alloc.free(a);
        alloc.free(c);
    }
}

#[test]
fn tail_overrun_on_first_block_has_no_breadcrumb() {
    let alloc = secured();
    let p = alloc.malloc(4, "first");
    unsafe { p.add(4).write(0xFF) };
    unsafe { alloc.free(p) };
    let records = alloc.diagnostics();
    assert_eq!(records.len(), 1);
    assert!(records[0].message.contains("no name found"));
    assert_eq!(alloc.get_totblock(), 0);
}

#[test]
fn header_damage_is_reported_by_name() {
    let alloc = secured();
    let a = alloc.malloc(64, "A");
    let b = alloc.malloc(64, "B");
    unsafe { b.sub(HEADER_SIZE).write_bytes(0, HEADER_SIZE) };

    assert!(!alloc.check_memory());
    unsafe { alloc.free(b) };
    let records = alloc.diagnostics();
    assert!(
        records
            .iter()
            .filter(|r| r.event == "header_corruption")
            .all(|r| r.block == Some("B"))
    );
    assert!(records.iter().any(|r| r.op == "free" && r.event == "header_corruption"));
    assert!(alloc.check_memory());
    unsafe { alloc.free(a) };
    assert_eq!(alloc.get_totblock(), 0);
    assert_eq!(alloc.get_mem_in_use(), 0);
}

#[test]
fn foreign_and_misaligned_pointers_are_no_ops() {
    let alloc = secured();
    let p = alloc.malloc(16, "real");
    let mut local = [0_u64; 2];
    unsafe {
        alloc.free(local.as_mut_ptr().cast());
        alloc.free(p.add(1));
    }
    assert_eq!(events(&alloc), ["invalid_pointer", "invalid_pointer"]);
    let records = alloc.diagnostics();
    assert!(records[0].message.contains("pointer not in memlist"));
    assert!(records[0].message.contains("possibly freed earlier"));
    assert!(records[1].message.contains("illegal pointer"));
    assert_eq!(alloc.get_totblock(), 1);
    unsafe { alloc.free(p) };
}

#[test]
fn realloc_of_untracked_pointer_returns_null() {
    let alloc = secured();
    let mut local = [0_u64; 2];
    let q = unsafe { alloc.realloc(local.as_mut_ptr().cast(), 64) };
    assert!(q.is_null());
    assert_eq!(alloc.get_totblock(), 0);
    assert_eq!(events(&alloc), ["invalid_pointer"]);
}

#[test]
fn memstats_scenario_orders_by_total_size() {
    let alloc = secured();
    let a = alloc.malloc(16, "A");
    let b = alloc.malloc(32, "B");
    let c = alloc.malloc(16, "C");

    let stats = alloc.memstats();
    let names: Vec<_> = stats.entries.iter().map(|e| e.name).collect();
    assert_eq!(names, ["B", "A", "C"]);
    assert_eq!(stats.total_blocks, 3);
    assert_eq!(stats.mem_in_use, 64);

    let mut out = Vec::new();
    alloc.write_memstats(&mut out).unwrap();
    let table = String::from_utf8(out).unwrap();
    assert!(table.contains("ITEMS TOTAL-MiB AVERAGE-KiB NAME"));
    let b_line = table.lines().position(|l| l.ends_with(" B")).unwrap();
    let a_line = table.lines().position(|l| l.ends_with(" A")).unwrap();
    assert!(b_line < a_line);

    unsafe {
        alloc.free(a);
        alloc.free(b);
        alloc.free(c);
    }
    assert_eq!(alloc.get_totblock(), 0);
    assert!(alloc.check_memory());
    assert!(alloc.memstats().entries.is_empty());
}

#[test]
fn diagnostics_export_as_jsonl() {
    let alloc = secured();
    unsafe { alloc.free(std::ptr::null_mut()) };
    let mut out = Vec::new();
    alloc.reporter().write_jsonl(&mut out).unwrap();
    let text = String::from_utf8(out).unwrap();
    let line: serde_json::Value = serde_json::from_str(text.lines().next().unwrap()).unwrap();
    assert_eq!(line["event"], "null_pointer");
    assert_eq!(line["backend"], "secured");
    assert_eq!(line["level"], "warn");
}
