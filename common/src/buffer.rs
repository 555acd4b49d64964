use std::collections::VecDeque;

use crate::config::BufferConfig;
use crate::types::{Channel, ChannelStats, HistoryRecord, TelemetryReading, TrendDirection};

/// Bounded, time-ordered sample window for every sensor channel.
///
/// Two regimes share the same storage. Before a historical load the window
/// is a plain FIFO capped at `live_capacity`. After a load of N records
/// the first N slots are historical and live readings overwrite the
/// trailing slot in place, so mixing the two never grows the window.
#[derive(Debug, Clone)]
pub struct TelemetryBuffer {
    config: BufferConfig,
    labels: VecDeque<String>,
    series: [VecDeque<f64>; Channel::ALL.len()],
    history_count: usize,
}

impl TelemetryBuffer {
    pub fn new(mut config: BufferConfig) -> Self {
        config.sanitize();
        Self {
            config,
            labels: VecDeque::new(),
            series: std::array::from_fn(|_| VecDeque::new()),
            history_count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Number of historical slots at the head of the window, zero when no
    /// batch has been loaded.
    pub fn history_count(&self) -> usize {
        self.history_count
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.labels.iter().map(String::as_str)
    }

    pub fn values(&self, channel: Channel) -> impl Iterator<Item = f64> + '_ {
        self.series[channel.index()].iter().copied()
    }

    pub fn latest(&self, channel: Channel) -> Option<f64> {
        self.series[channel.index()].back().copied()
    }

    /// Appends one live reading. Raw values are scaled here, exactly once;
    /// fields the payload omits are stored as 0.
    pub fn append_live(&mut self, reading: &TelemetryReading, label: String) {
        let scaled: Vec<f64> = Channel::ALL
            .iter()
            .map(|&channel| {
                reading
                    .raw(channel)
                    .map(|raw| channel.scale(raw))
                    .unwrap_or(0.0)
            })
            .collect();

        let len = self.labels.len();
        if self.history_count > 0 && len >= self.history_count {
            // Historical head present: the trailing slot is the live one
            // and gets overwritten instead of growing the window.
            self.labels[len - 1] = label;
            for (channel, value) in Channel::ALL.iter().zip(scaled) {
                self.series[channel.index()][len - 1] = value;
            }
        } else {
            self.labels.push_back(label);
            for (channel, value) in Channel::ALL.iter().zip(scaled) {
                self.series[channel.index()].push_back(value);
            }
            if self.labels.len() > self.config.live_capacity {
                self.labels.pop_front();
                for series in &mut self.series {
                    series.pop_front();
                }
            }
        }
    }

    /// Replaces the window with a historical batch.
    ///
    /// The wire delivers records newest-first; they are reversed into
    /// chronological order and capped at `history_capacity`, keeping the
    /// newest. A trailing live sample survives the reload: live labels
    /// are clock times and never contain a dash, which is how they are
    /// told apart from `MM-DD`-style historical labels. Records without a
    /// usable date get `fallback_label`.
    pub fn load_historical(&mut self, records: &[HistoryRecord], fallback_label: &str) -> usize {
        let live = self.take_trailing_live();

        self.labels.clear();
        for series in &mut self.series {
            series.clear();
        }

        let skip = records.len().saturating_sub(self.config.history_capacity);
        for record in records.iter().rev().skip(skip) {
            self.labels.push_back(record.time_label(fallback_label));
            for &channel in Channel::ALL.iter() {
                let value = record
                    .raw(channel)
                    .map(|raw| channel.scale(raw))
                    .unwrap_or(0.0);
                self.series[channel.index()].push_back(value);
            }
        }
        self.history_count = self.labels.len();

        if let Some((label, values)) = live {
            self.labels.push_back(label);
            for (channel, value) in Channel::ALL.iter().zip(values) {
                self.series[channel.index()].push_back(value);
            }
        }
        self.history_count
    }

    pub fn clear(&mut self) {
        self.labels.clear();
        for series in &mut self.series {
            series.clear();
        }
        self.history_count = 0;
    }

    /// Window extremes plus short-horizon trend; `None` on an empty window.
    pub fn stats(&self, channel: Channel) -> Option<ChannelStats> {
        let series = &self.series[channel.index()];
        let first = *series.front()?;

        let (min, max) = series
            .iter()
            .fold((first, first), |(min, max), &v| (min.min(v), max.max(v)));

        Some(ChannelStats {
            min,
            max,
            trend: self.trend(series),
        })
    }

    fn trend(&self, series: &VecDeque<f64>) -> TrendDirection {
        let len = series.len();
        if len < 2 {
            return TrendDirection::Flat;
        }
        let base = series[len.saturating_sub(self.config.trend_lookback)];
        let delta = series[len - 1] - base;
        if delta > self.config.trend_epsilon {
            TrendDirection::Up
        } else if delta < -self.config.trend_epsilon {
            TrendDirection::Down
        } else {
            TrendDirection::Flat
        }
    }

    fn take_trailing_live(&mut self) -> Option<(String, Vec<f64>)> {
        let last = self.labels.back()?;
        if last.contains('-') {
            return None;
        }
        let idx = self.labels.len() - 1;
        let values = Channel::ALL
            .iter()
            .map(|&channel| self.series[channel.index()][idx])
            .collect();
        Some((last.clone(), values))
    }
}

/// Decision for one buffer mutation: redraw now, arm a trailing-edge
/// timer, or nothing because a timer is already armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedrawDecision {
    Now,
    Schedule(u64),
    AlreadyPending,
}

/// Coalesces bursts of buffer mutations into at most one redraw signal
/// per interval. Pure; the caller owns the actual timer.
#[derive(Debug, Clone)]
pub struct RedrawGate {
    min_interval_ms: u64,
    last_redraw_ms: Option<u64>,
    pending: bool,
}

impl RedrawGate {
    pub fn new(min_interval_ms: u64) -> Self {
        Self {
            min_interval_ms,
            last_redraw_ms: None,
            pending: false,
        }
    }

    pub fn on_update(&mut self, now_ms: u64) -> RedrawDecision {
        if let Some(last) = self.last_redraw_ms {
            let elapsed = now_ms.saturating_sub(last);
            if elapsed < self.min_interval_ms {
                if self.pending {
                    return RedrawDecision::AlreadyPending;
                }
                self.pending = true;
                return RedrawDecision::Schedule(self.min_interval_ms - elapsed);
            }
        }
        // An immediate redraw supersedes any armed timer.
        self.pending = false;
        self.last_redraw_ms = Some(now_ms);
        RedrawDecision::Now
    }

    /// The armed timer fired; returns whether a redraw is still owed.
    pub fn on_timer(&mut self, now_ms: u64) -> bool {
        if !self.pending {
            return false;
        }
        self.pending = false;
        self.last_redraw_ms = Some(now_ms);
        true
    }
}
