//! Rolling technical factors
//!
//! Each factor is a small state machine fed one observation at a time in
//! chronological order. `update` returns `None` while the look-back window
//! is not yet full, which is how the indicator engine produces its leading
//! null cells. Constructors reject a zero period with `ConfigError`.

use statrs::statistics::Statistics;
use std::collections::VecDeque;

use crate::error::{AshareError, Result};

/// Fixed-capacity FIFO of the most recent observations
#[derive(Debug, Clone)]
struct Window {
    len: usize,
    buf: VecDeque<f64>,
}

impl Window {
    fn new(len: usize) -> Result<Self> {
        if len == 0 {
            return Err(AshareError::ConfigError(
                "rolling window length must be > 0".into(),
            ));
        }
        Ok(Self {
            len,
            buf: VecDeque::with_capacity(len + 1),
        })
    }

    /// Push and report whether the window is full
    fn push(&mut self, value: f64) -> bool {
        self.buf.push_back(value);
        while self.buf.len() > self.len {
            self.buf.pop_front();
        }
        self.is_full()
    }

    fn is_full(&self) -> bool {
        self.buf.len() == self.len
    }

    fn mean(&self) -> f64 {
        self.buf.iter().sum::<f64>() / self.len as f64
    }

    fn max(&self) -> f64 {
        self.buf.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }

    fn min(&self) -> f64 {
        self.buf.iter().copied().fold(f64::INFINITY, f64::min)
    }
}

#[derive(Debug, Clone)]
pub struct SimpleMovingAverage {
    window: Window,
}

impl SimpleMovingAverage {
    pub fn new(period: usize) -> Result<Self> {
        Ok(Self {
            window: Window::new(period)?,
        })
    }

    pub fn update(&mut self, value: f64) -> Option<f64> {
        self.window.push(value);
        self.current()
    }

    /// Whole-series convenience over `update`
    pub fn compute(period: usize, values: &[f64]) -> Result<Vec<Option<f64>>> {
        let mut sma = Self::new(period)?;
        Ok(values.iter().map(|&v| sma.update(v)).collect())
    }

    pub fn current(&self) -> Option<f64> {
        self.window.is_full().then(|| self.window.mean())
    }
}

/// Linear weights 1..=N, newest observation weighted N
#[derive(Debug, Clone)]
pub struct WeightedMovingAverage {
    window: Window,
    weight_sum: f64,
}

impl WeightedMovingAverage {
    pub fn new(period: usize) -> Result<Self> {
        Ok(Self {
            window: Window::new(period)?,
            weight_sum: (period * (period + 1)) as f64 / 2.0,
        })
    }

    pub fn update(&mut self, value: f64) -> Option<f64> {
        if !self.window.push(value) {
            return None;
        }
        let weighted: f64 = self
            .window
            .buf
            .iter()
            .zip(1..)
            .map(|(&v, w)| v * w as f64)
            .sum();
        Some(weighted / self.weight_sum)
    }

    pub fn compute(period: usize, values: &[f64]) -> Result<Vec<Option<f64>>> {
        let mut wma = Self::new(period)?;
        Ok(values.iter().map(|&v| wma.update(v)).collect())
    }
}

/// EMA seeded with the simple mean of the first `span` observations, then
/// `ema = alpha * value + (1 - alpha) * prev` with `alpha = 2 / (span + 1)`.
#[derive(Debug, Clone)]
pub struct ExponentialMovingAverage {
    alpha: f64,
    seed: Window,
    value: Option<f64>,
}

impl ExponentialMovingAverage {
    pub fn new(span: usize) -> Result<Self> {
        Ok(Self {
            alpha: 2.0 / (span as f64 + 1.0),
            seed: Window::new(span)?,
            value: None,
        })
    }

    pub fn update(&mut self, x: f64) -> Option<f64> {
        self.value = match self.value {
            Some(prev) => Some(self.alpha * x + (1.0 - self.alpha) * prev),
            None => {
                let seeded = self.seed.push(x);
                seeded.then(|| self.seed.mean())
            }
        };
        self.value
    }

    pub fn compute(span: usize, values: &[f64]) -> Result<Vec<Option<f64>>> {
        let mut ema = Self::new(span)?;
        Ok(values.iter().map(|&v| ema.update(v)).collect())
    }

    pub fn current(&self) -> Option<f64> {
        self.value
    }
}

/// MACD line, signal line and histogram
///
/// The signal EMA is only fed once the MACD line exists, and all three
/// outputs are withheld until the signal line is defined.
#[derive(Debug, Clone)]
pub struct MACD {
    fast: ExponentialMovingAverage,
    slow: ExponentialMovingAverage,
    signal: ExponentialMovingAverage,
}

impl MACD {
    pub fn with_params(fast: usize, slow: usize, signal: usize) -> Result<Self> {
        Ok(Self {
            fast: ExponentialMovingAverage::new(fast)?,
            slow: ExponentialMovingAverage::new(slow)?,
            signal: ExponentialMovingAverage::new(signal)?,
        })
    }

    /// Returns `(line, signal, histogram)`
    pub fn update(&mut self, close: f64) -> Option<(f64, f64, f64)> {
        // both EMAs must see every close, so no early return before this
        let (fast, slow) = (self.fast.update(close), self.slow.update(close));
        let line = fast? - slow?;
        let signal = self.signal.update(line)?;
        Some((line, signal, line - signal))
    }
}

/// RSI with Wilder smoothing
///
/// The first average gain/loss is the simple mean of the first `period`
/// deltas; afterwards `avg = (avg * (period - 1) + x) / period`.
#[derive(Debug, Clone)]
pub struct RSI {
    period: f64,
    last_close: Option<f64>,
    gains: Window,
    losses: Window,
    averages: Option<(f64, f64)>,
}

impl RSI {
    pub fn new(period: usize) -> Result<Self> {
        Ok(Self {
            period: period as f64,
            last_close: None,
            gains: Window::new(period)?,
            losses: Window::new(period)?,
            averages: None,
        })
    }

    pub fn update(&mut self, close: f64) -> Option<f64> {
        let delta = close - self.last_close.replace(close)?;
        let (gain, loss) = (delta.max(0.0), (-delta).max(0.0));

        let n = self.period;
        let (avg_gain, avg_loss) = match self.averages {
            Some((g, l)) => ((g * (n - 1.0) + gain) / n, (l * (n - 1.0) + loss) / n),
            None => {
                self.gains.push(gain);
                if !self.losses.push(loss) {
                    return None;
                }
                (self.gains.mean(), self.losses.mean())
            }
        };
        self.averages = Some((avg_gain, avg_loss));

        if avg_loss == 0.0 {
            // flat series has no momentum either way
            return Some(if avg_gain == 0.0 { 50.0 } else { 100.0 });
        }
        Some(100.0 - 100.0 / (1.0 + avg_gain / avg_loss))
    }

    pub fn compute(period: usize, values: &[f64]) -> Result<Vec<Option<f64>>> {
        let mut rsi = Self::new(period)?;
        Ok(values.iter().map(|&v| rsi.update(v)).collect())
    }
}

/// KDJ stochastic oscillator
///
/// Raw %K over a `period` high/low window (0 when the window is flat, as
/// TA-Lib's STOCH does), K = SMA(raw %K, k_period), D = SMA(K, d_period),
/// J = 3K - 2D.
#[derive(Debug, Clone)]
pub struct Stochastic {
    highs: Window,
    lows: Window,
    k: SimpleMovingAverage,
    d: SimpleMovingAverage,
}

impl Stochastic {
    pub fn new(period: usize, k_period: usize, d_period: usize) -> Result<Self> {
        Ok(Self {
            highs: Window::new(period)?,
            lows: Window::new(period)?,
            k: SimpleMovingAverage::new(k_period)?,
            d: SimpleMovingAverage::new(d_period)?,
        })
    }

    /// Returns `(K, D, J)`
    pub fn update(&mut self, high: f64, low: f64, close: f64) -> Option<(f64, f64, f64)> {
        self.highs.push(high);
        if !self.lows.push(low) {
            return None;
        }

        let (hh, ll) = (self.highs.max(), self.lows.min());
        let raw = if hh > ll {
            (close - ll) / (hh - ll) * 100.0
        } else {
            0.0
        };

        let k = self.k.update(raw)?;
        let d = self.d.update(k)?;
        Some((k, d, 3.0 * k - 2.0 * d))
    }
}

/// Bollinger bands over a population standard deviation
#[derive(Debug, Clone)]
pub struct BollingerBands {
    window: Window,
    width: f64,
}

impl BollingerBands {
    pub fn new(period: usize, num_std: f64) -> Result<Self> {
        Ok(Self {
            window: Window::new(period)?,
            width: num_std,
        })
    }

    /// Returns `(upper, middle, lower)`
    pub fn update(&mut self, close: f64) -> Option<(f64, f64, f64)> {
        if !self.window.push(close) {
            return None;
        }
        let middle = self.window.mean();
        let sigma = if self.window.len > 1 {
            self.window.buf.iter().population_std_dev()
        } else {
            0.0
        };
        Some((middle + self.width * sigma, middle, middle - self.width * sigma))
    }
}

/// Running on-balance volume, starting from the first day's volume
#[derive(Debug, Clone, Default)]
pub struct OnBalanceVolume {
    total: f64,
    last_close: Option<f64>,
}

impl OnBalanceVolume {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, close: f64, volume: f64) -> f64 {
        self.total = match self.last_close.replace(close) {
            None => volume,
            Some(prev) if close > prev => self.total + volume,
            Some(prev) if close < prev => self.total - volume,
            Some(_) => self.total,
        };
        self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_sma() {
        let out = SimpleMovingAverage::compute(3, &[1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
        assert_eq!(out, vec![None, None, Some(2.0), Some(3.0), Some(4.0)]);
    }

    #[test]
    fn test_wma() {
        let out = WeightedMovingAverage::compute(3, &[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(out[1], None);
        // (1*1 + 2*2 + 3*3) / 6
        assert_relative_eq!(out[2].unwrap(), 14.0 / 6.0);
        assert_relative_eq!(out[3].unwrap(), 20.0 / 6.0);
    }

    #[test]
    fn test_ema_seeded_with_sma() {
        let out = ExponentialMovingAverage::compute(3, &[2.0, 4.0, 6.0, 8.0]).unwrap();
        assert_eq!(out[0], None);
        assert_eq!(out[1], None);
        assert_relative_eq!(out[2].unwrap(), 4.0);
        // alpha = 0.5
        assert_relative_eq!(out[3].unwrap(), 6.0);
    }

    #[test]
    fn test_macd_first_defined_row() {
        let mut macd = MACD::with_params(12, 26, 9).unwrap();
        let first = (0..60)
            .map(|i| macd.update(100.0 + (i as f64 * 0.3).sin() * 5.0))
            .position(|v| v.is_some());
        // slow - 1 + signal - 1
        assert_eq!(first, Some(33));
    }

    #[test]
    fn test_macd_histogram_identity() {
        let mut macd = MACD::with_params(3, 6, 4).unwrap();
        for i in 0..30 {
            if let Some((line, signal, hist)) = macd.update(10.0 + i as f64 * 0.5) {
                assert_relative_eq!(hist, line - signal, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_rsi_wilder() {
        let values = [44.0, 44.5, 44.0, 45.0, 46.0];
        let out = RSI::compute(2, &values).unwrap();
        assert_eq!(out[0], None);
        assert_eq!(out[1], None);
        // seed: gains [0.5, 0], losses [0, 0.5] -> rs 1 -> 50
        assert_relative_eq!(out[2].unwrap(), 50.0);
        // avg_gain = (0.25 + 1) / 2, avg_loss = 0.25 / 2
        let rs: f64 = 0.625 / 0.125;
        assert_relative_eq!(out[3].unwrap(), 100.0 - 100.0 / (1.0 + rs));
    }

    #[test]
    fn test_rsi_bounds() {
        let values: Vec<f64> = (0..50).map(|i| 100.0 + ((i * 7) % 11) as f64).collect();
        for v in RSI::compute(14, &values).unwrap().into_iter().flatten() {
            assert!((0.0..=100.0).contains(&v));
        }
    }

    #[test]
    fn test_stochastic_kdj() {
        let mut kdj = Stochastic::new(9, 3, 3).unwrap();
        let mut first = None;
        for i in 0..30 {
            let base = 100.0 + i as f64;
            if let Some((k, d, j)) = kdj.update(base + 5.0, base - 5.0, base) {
                first.get_or_insert(i);
                assert!((0.0..=100.0).contains(&k));
                assert!((0.0..=100.0).contains(&d));
                assert_relative_eq!(j, 3.0 * k - 2.0 * d);
            }
        }
        assert_eq!(first, Some(12));
    }

    #[test]
    fn test_stochastic_flat_window_is_zero() {
        let mut kdj = Stochastic::new(3, 1, 1).unwrap();
        let mut last = None;
        for _ in 0..5 {
            last = kdj.update(10.0, 10.0, 10.0);
        }
        assert_eq!(last, Some((0.0, 0.0, 0.0)));
    }

    #[test]
    fn test_zero_period_is_config_error() {
        assert!(matches!(
            SimpleMovingAverage::new(0),
            Err(AshareError::ConfigError(_))
        ));
        assert!(WeightedMovingAverage::compute(0, &[1.0]).is_err());
        assert!(MACD::with_params(12, 0, 9).is_err());
        assert!(RSI::new(0).is_err());
        assert!(Stochastic::new(9, 3, 0).is_err());
        assert!(BollingerBands::new(0, 2.0).is_err());
    }

    #[test]
    fn test_bollinger_population_std() {
        let mut bb = BollingerBands::new(4, 2.0).unwrap();
        let mut out = None;
        for v in [2.0, 4.0, 4.0, 6.0] {
            out = bb.update(v);
        }
        let (upper, middle, lower) = out.unwrap();
        // population variance = (4 + 0 + 0 + 4) / 4 = 2
        assert_relative_eq!(middle, 4.0);
        assert_relative_eq!(upper, 4.0 + 2.0 * 2f64.sqrt(), epsilon = 1e-12);
        assert_relative_eq!(lower, 4.0 - 2.0 * 2f64.sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn test_obv() {
        let mut obv = OnBalanceVolume::new();
        assert_eq!(obv.update(10.0, 100.0), 100.0);
        assert_eq!(obv.update(11.0, 50.0), 150.0);
        assert_eq!(obv.update(11.0, 70.0), 150.0);
        assert_eq!(obv.update(9.0, 30.0), 120.0);
    }
}
