use super::Ema;

/// Streaming MACD: `macd = EMA_fast - EMA_slow`, `signal = EMA(macd)`,
/// `hist = macd - signal`
///
/// All outputs are `None` until their constituent EMAs are populated.
#[derive(Debug, Clone)]
pub struct Macd {
    fast: Ema,
    slow: Ema,
    signal_ema: Ema,
    macd: Option<f64>,
    signal: Option<f64>,
    hist: Option<f64>,
}

impl Macd {
    /// # Panics
    /// Panics if any period is zero or `fast >= slow`.
    pub fn new(fast: usize, slow: usize, signal: usize) -> Self {
        assert!(fast > 0 && slow > 0 && signal > 0, "MACD periods must be positive");
        assert!(fast < slow, "MACD fast period must be < slow period");
        Self {
            fast: Ema::new(fast),
            slow: Ema::new(slow),
            signal_ema: Ema::new(signal),
            macd: None,
            signal: None,
            hist: None,
        }
    }

    pub fn update(&mut self, price: f64) -> (Option<f64>, Option<f64>, Option<f64>) {
        let f = self.fast.update(price);
        let s = self.slow.update(price);
        self.macd = Some(f - s);

        match self.macd {
            None => {
                self.signal = None;
                self.hist = None;
            }
            Some(m) => {
                let sig = self.signal_ema.update(m);
                self.signal = Some(sig);
                self.hist = Some(m - sig);
            }
        }

        (self.macd, self.signal, self.hist)
    }

    pub fn macd(&self) -> Option<f64> {
        self.macd
    }

    pub fn signal(&self) -> Option<f64> {
        self.signal
    }

    pub fn hist(&self) -> Option<f64> {
        self.hist
    }
}
