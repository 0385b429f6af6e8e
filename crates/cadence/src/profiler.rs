// =============================================================================
// Profiling — per-unit run timing
// =============================================================================
//
// The scheduler times every unit body it runs and, when profiling is enabled
// in RuntimeConfig, folds the duration into a Profiler keyed by unit name.
// Aggregates are kept instead of raw events so a run of millions of ticks
// stays at constant memory.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Profiler — aggregates named durations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct Aggregate {
    count: usize,
    total: Duration,
    min: Duration,
    max: Duration,
}

/// Collects run durations per unit name.
///
/// # Example
/// ```
/// use cadence::profiler::Profiler;
/// use std::time::Duration;
///
/// let mut prof = Profiler::new();
/// prof.record("loader", Duration::from_millis(2));
/// prof.record("loader", Duration::from_millis(4));
/// let report = prof.report();
/// assert_eq!(report.entries[0].count, 2);
/// println!("{}", report);
/// ```
#[derive(Debug, Default, Clone)]
pub struct Profiler {
    by_name: HashMap<String, Aggregate>,
    order: Vec<String>,
}

impl Profiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one duration into the aggregate for `name`.
    pub fn record(&mut self, name: &str, duration: Duration) {
        match self.by_name.get_mut(name) {
            Some(agg) => {
                agg.count += 1;
                agg.total += duration;
                agg.min = agg.min.min(duration);
                agg.max = agg.max.max(duration);
            }
            None => {
                self.order.push(name.to_string());
                self.by_name.insert(
                    name.to_string(),
                    Aggregate {
                        count: 1,
                        total: duration,
                        min: duration,
                        max: duration,
                    },
                );
            }
        }
    }

    /// Total recorded time across all units.
    pub fn total_time(&self) -> Duration {
        self.by_name.values().map(|a| a.total).sum()
    }

    /// Build a [`ProfileReport`], slowest unit first.
    pub fn report(&self) -> ProfileReport {
        let mut entries: Vec<ProfileEntry> = self
            .order
            .iter()
            .filter_map(|name| {
                self.by_name.get(name).map(|a| ProfileEntry {
                    name: name.clone(),
                    count: a.count,
                    total: a.total,
                    min: a.min,
                    max: a.max,
                    avg: a.total / a.count.max(1) as u32,
                })
            })
            .collect();
        // Stable sort keeps first-run order among equal totals.
        entries.sort_by(|a, b| b.total.cmp(&a.total));
        ProfileReport {
            entries,
            total: self.total_time(),
        }
    }
}

// ---------------------------------------------------------------------------
// ProfileEntry / ProfileReport
// ---------------------------------------------------------------------------

/// Aggregated statistics for one unit.
#[derive(Debug, Clone)]
pub struct ProfileEntry {
    pub name: String,
    pub count: usize,
    pub total: Duration,
    pub min: Duration,
    pub max: Duration,
    pub avg: Duration,
}

/// A formatted timing report, printed with `Display`.
#[derive(Debug, Clone)]
pub struct ProfileReport {
    pub entries: Vec<ProfileEntry>,
    pub total: Duration,
}

impl ProfileReport {
    pub fn get(&self, name: &str) -> Option<&ProfileEntry> {
        self.entries.iter().find(|e| e.name == name)
    }
}

impl fmt::Display for ProfileReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "╔══════════════════════════════════════════════════════════════════════════════╗"
        )?;
        writeln!(
            f,
            "║                            Unit Timing Report                                ║"
        )?;
        writeln!(
            f,
            "╠══════════════════════════════════════════════════════════════════════════════╣"
        )?;
        writeln!(
            f,
            "║ {:<20} {:>8} {:>12} {:>12} {:>12} {:>6} ║",
            "Unit", "Runs", "Total", "Avg", "Max", "%"
        )?;
        writeln!(
            f,
            "╠══════════════════════════════════════════════════════════════════════════════╣"
        )?;
        let total_secs = self.total.as_secs_f64();
        for e in &self.entries {
            let pct = if total_secs > 0.0 {
                e.total.as_secs_f64() / total_secs * 100.0
            } else {
                0.0
            };
            let name = if e.name.chars().count() > 20 {
                format!("{}…", e.name.chars().take(19).collect::<String>())
            } else {
                e.name.clone()
            };
            writeln!(
                f,
                "║ {:<20} {:>8} {:>12} {:>12} {:>12} {:>5.1}% ║",
                name,
                e.count,
                format_duration(e.total),
                format_duration(e.avg),
                format_duration(e.max),
                pct
            )?;
        }
        writeln!(
            f,
            "╠══════════════════════════════════════════════════════════════════════════════╣"
        )?;
        writeln!(
            f,
            "║ {:<20} {:>8} {:>12} {:>40} ║",
            "TOTAL",
            "",
            format_duration(self.total),
            ""
        )?;
        write!(
            f,
            "╚══════════════════════════════════════════════════════════════════════════════╝"
        )
    }
}

/// Human-readable duration with a unit suited to its magnitude.
pub fn format_duration(d: Duration) -> String {
    let us = d.as_secs_f64() * 1e6;
    if us < 1_000.0 {
        format!("{us:.1}µs")
    } else if us < 1_000_000.0 {
        format!("{:.2}ms", us / 1e3)
    } else {
        format!("{:.2}s", us / 1e6)
    }
}
