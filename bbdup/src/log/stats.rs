//! Statistics about duplication and promotion. Collection is enabled either by the embedder
//! (`Options::collect_stats`) or by the end user defining `BBDUP_LOG_STATS=<path|->`; in the latter
//! case the statistics are written out as JSON when the engine exits.

#[cfg(feature = "bbdup_testing")]
use parking_lot::Condvar;
use parking_lot::Mutex;
use std::{env, fs, ops::DerefMut};

pub(crate) struct Stats {
    // Most runs won't collect statistics, so the outer `Option` keeps the common case down to a
    // `NULL` check: only if stats are being recorded do we need to take the lock.
    inner: Option<Mutex<StatsInner>>,
    #[cfg(feature = "bbdup_testing")]
    wait_until_condvar: Condvar,
}

/// A point-in-time copy of the engine's statistics.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct StatsSnapshot {
    /// How many blocks were built with duplication disabled?
    pub no_dup_count: u64,
    /// How many blocks were built with dynamic handling disabled?
    pub no_dynamic_handling_count: u64,
    /// How many cases have been added to blocks at runtime?
    pub gen_count: u64,
    /// How many executions fell back to a default variant without a new case being added?
    pub bail_count: u64,
}

struct StatsInner {
    /// Where to write output at exit. `-` means stderr; `None` means don't output.
    output_path: Option<String>,
    counts: StatsSnapshot,
}

impl Stats {
    pub fn new(collect: bool) -> Self {
        let output_path = env::var("BBDUP_LOG_STATS").ok();
        let inner = if collect || output_path.is_some() {
            Some(Mutex::new(StatsInner {
                output_path,
                counts: StatsSnapshot::default(),
            }))
        } else {
            None
        };
        Self {
            inner,
            #[cfg(feature = "bbdup_testing")]
            wait_until_condvar: Condvar::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// If statistics are being collected, update them by running `f`, otherwise return
    /// immediately without calling `f`.
    fn update_with<F>(&self, f: F)
    where
        F: FnOnce(&mut StatsInner),
    {
        if let Some(mtx) = &self.inner {
            let mut lk = mtx.lock();
            f(lk.deref_mut());
            #[cfg(feature = "bbdup_testing")]
            {
                drop(lk);
                self.wait_until_condvar.notify_all();
            }
        }
    }

    /// Suspend this thread until `test` returns true for the current statistics. The statistics
    /// lock is held while `test` runs.
    ///
    /// # Panics
    ///
    /// If statistics collection is disabled.
    #[cfg(feature = "bbdup_testing")]
    pub fn wait_until<F>(&self, test: F)
    where
        F: Fn(&StatsSnapshot) -> bool,
    {
        match &self.inner {
            Some(mtx) => {
                let mut lk = mtx.lock();
                while !test(&lk.counts) {
                    self.wait_until_condvar.wait(&mut lk);
                }
            }
            None => panic!("Can't call wait_until unless statistics are enabled"),
        }
    }

    pub fn no_dup(&self) {
        self.update_with(|inner| inner.counts.no_dup_count += 1);
    }

    pub fn no_dynamic_handling(&self) {
        self.update_with(|inner| inner.counts.no_dynamic_handling_count += 1);
    }

    pub fn case_generated(&self) {
        self.update_with(|inner| inner.counts.gen_count += 1);
    }

    pub fn bail(&self) {
        self.update_with(|inner| inner.counts.bail_count += 1);
    }

    /// Return a copy of the current statistics, or `None` if collection is disabled.
    pub fn snapshot(&self) -> Option<StatsSnapshot> {
        self.inner.as_ref().map(|mtx| mtx.lock().counts)
    }

    /// Output these statistics to the configured output path, if there is one.
    pub(crate) fn output(&self) {
        if let Some(mtx) = &self.inner {
            mtx.lock().output();
        }
    }
}

impl StatsInner {
    fn output(&self) {
        let json = self.to_json();
        match self.output_path.as_deref() {
            Some("-") => eprintln!("{json}"),
            Some(p) => {
                fs::write(p, json).ok();
            }
            None => (),
        }
    }

    /// Turn these statistics into JSON. Fields are sorted by name so that the output can be
    /// matched textually.
    fn to_json(&self) -> String {
        let c = &self.counts;
        let mut fields = [
            ("bail_count", c.bail_count),
            ("gen_count", c.gen_count),
            ("no_dup_count", c.no_dup_count),
            ("no_dynamic_handling_count", c.no_dynamic_handling_count),
        ];
        fields.sort_unstable_by(|(k1, _), (k2, _)| k1.cmp(k2));
        format!(
            r#"{{
    {}
}}"#,
            fields
                .iter()
                .map(|(x, y)| format!(r#""{x}": {y}"#))
                .collect::<Vec<_>>()
                .join(",\n    ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_stats_ignore_updates() {
        let s = Stats {
            inner: None,
            #[cfg(feature = "bbdup_testing")]
            wait_until_condvar: Condvar::new(),
        };
        s.bail();
        assert!(!s.is_enabled());
        assert_eq!(s.snapshot(), None);
    }

    #[test]
    fn counts_and_json() {
        let s = Stats::new(true);
        s.bail();
        s.bail();
        s.case_generated();
        s.no_dup();
        let snap = s.snapshot().unwrap();
        assert_eq!(snap.bail_count, 2);
        assert_eq!(snap.gen_count, 1);
        assert_eq!(snap.no_dup_count, 1);
        assert_eq!(snap.no_dynamic_handling_count, 0);
        let json = s.inner.as_ref().unwrap().lock().to_json();
        fm::FMatcher::new(
            r#"{
    "bail_count": 2,
    "gen_count": 1,
    "no_dup_count": 1,
    "no_dynamic_handling_count": 0
}"#,
        )
        .unwrap()
        .matches(&json)
        .unwrap();
    }
}
