//! Memory statistics: per-name aggregation and the printed table.

use std::io::Write;

use serde::Serialize;

use crate::config::BackendKind;

const MIB: f64 = 1024.0 * 1024.0;

/// Aggregated usage for one block name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NameStat {
    pub name: &'static str,
    /// Number of live blocks carrying this name.
    pub items: usize,
    /// Sum of their lengths in bytes.
    pub total_bytes: usize,
}

impl NameStat {
    #[must_use]
    pub fn average_bytes(&self) -> f64 {
        if self.items == 0 {
            0.0
        } else {
            self.total_bytes as f64 / self.items as f64
        }
    }
}

/// Point-in-time allocator statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemStats {
    pub backend: BackendKind,
    pub mem_in_use: usize,
    pub total_blocks: usize,
    /// Per-name breakdown, largest total first. Empty for the light backend,
    /// which does not track names.
    pub entries: Vec<NameStat>,
}

impl MemStats {
    /// Render the table printed by `print_memstats`.
    pub fn write_table<W: Write>(&self, out: &mut W) -> std::io::Result<()> {
        writeln!(
            out,
            "Total memory allocated : {:.3} Mio",
            self.mem_in_use as f64 / MIB
        )?;
        writeln!(out, "Number of allocated block : {}", self.total_blocks)?;
        if self.backend == BackendKind::Light {
            return Ok(());
        }
        writeln!(out, "  ITEMS TOTAL-MiB AVERAGE-KiB NAME :")?;
        for entry in &self.entries {
            writeln!(
                out,
                "{:7} ({:8.3} {:10.3}) {}",
                entry.items,
                entry.total_bytes as f64 / MIB,
                entry.average_bytes() / 1024.0,
                entry.name
            )?;
        }
        Ok(())
    }
}

/// Merge `(name, len)` pairs by name and order by aggregated size.
///
/// Entries are first sorted by name so equal names become adjacent, merged,
/// then stably re-sorted by total size descending; ties keep name order.
#[must_use]
pub fn aggregate(mut blocks: Vec<(&'static str, usize)>) -> Vec<NameStat> {
    blocks.sort_by(|a, b| a.0.cmp(b.0));

    let mut merged: Vec<NameStat> = Vec::with_capacity(blocks.len());
    for (name, len) in blocks {
        match merged.last_mut() {
            Some(last) if last.name == name => {
                last.items += 1;
                last.total_bytes += len;
            }
            _ => merged.push(NameStat {
                name,
                items: 1,
                total_bytes: len,
            }),
        }
    }

    merged.sort_by(|a, b| b.total_bytes.cmp(&a.total_bytes));
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_orders_by_total_then_name() {
        let stats = aggregate(vec![("C", 16), ("B", 32), ("A", 16)]);
        let names: Vec<_> = stats.iter().map(|s| s.name).collect();
        assert_eq!(names, ["B", "A", "C"]);
    }

    #[test]
    fn aggregate_merges_equal_names() {
        let stats = aggregate(vec![("tex", 100), ("mesh", 40), ("tex", 50), ("mesh", 40)]);
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].name, "tex");
        assert_eq!(stats[0].items, 2);
        assert_eq!(stats[0].total_bytes, 150);
        assert_eq!(stats[1].total_bytes, 80);
        assert!((stats[1].average_bytes() - 40.0).abs() < f64::EPSILON);
    }

    #[test]
    fn aggregate_empty() {
        assert!(aggregate(Vec::new()).is_empty());
    }

    #[test]
    fn table_lists_every_name() {
        let stats = MemStats {
            backend: BackendKind::Secured,
            mem_in_use: 64,
            total_blocks: 3,
            entries: aggregate(vec![("A", 16), ("B", 32), ("C", 16)]),
        };
        let mut out = Vec::new();
        stats.write_table(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[1], "Number of allocated block : 3");
        assert!(lines[2].contains("ITEMS"));
        assert!(lines[3].ends_with(" B"));
        assert!(lines[4].ends_with(" A"));
        assert!(lines[5].ends_with(" C"));
        assert!(lines[3].trim_start().starts_with('1'));
    }

    #[test]
    fn light_table_has_totals_only() {
        let stats = MemStats {
            backend: BackendKind::Light,
            mem_in_use: 0,
            total_blocks: 0,
            entries: Vec::new(),
        };
        let mut out = Vec::new();
        stats.write_table(&mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap().lines().count(), 2);
    }
}
