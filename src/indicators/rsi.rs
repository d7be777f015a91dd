/// Streaming Wilder RSI
///
/// Bootstraps by summing the first `period` deltas, converts the sums into
/// first Wilder averages on the `period`-th delta, then applies the
/// recurrence `avg = (avg*(n-1) + x)/n`. `value()` is `None` until enough
/// data has been fed.
#[derive(Debug, Clone)]
pub struct Rsi {
    period: usize,
    prev_price: Option<f64>,
    avg_gain: Option<f64>,
    avg_loss: Option<f64>,
    count: usize,
    value: Option<f64>,
}

impl Rsi {
    /// # Panics
    /// Panics if `period` is zero.
    pub fn new(period: usize) -> Self {
        assert!(period > 0, "RSI period must be positive");
        Self {
            period,
            prev_price: None,
            avg_gain: None,
            avg_loss: None,
            count: 0,
            value: None,
        }
    }

    pub fn update(&mut self, price: f64) -> Option<f64> {
        let prev = match self.prev_price {
            None => {
                self.prev_price = Some(price);
                self.count = 1;
                self.value = None;
                return None;
            }
            Some(p) => p,
        };

        let change = price - prev;
        let gain = change.max(0.0);
        let loss = (-change).max(0.0);

        if self.count <= self.period {
            // bootstrap: accumulate sums until we have `period` deltas
            let g = self.avg_gain.unwrap_or(0.0) + gain;
            let l = self.avg_loss.unwrap_or(0.0) + loss;
            if self.count < self.period {
                self.avg_gain = Some(g);
                self.avg_loss = Some(l);
                self.count += 1;
                self.value = None;
            } else {
                // first Wilder averages
                let ag = g / self.period as f64;
                let al = l / self.period as f64;
                self.avg_gain = Some(ag);
                self.avg_loss = Some(al);
                self.count += 1;
                self.value = Some(Self::rsi_from(ag, al));
            }
        } else {
            let n = self.period as f64;
            let ag = (self.avg_gain.unwrap_or(0.0) * (n - 1.0) + gain) / n;
            let al = (self.avg_loss.unwrap_or(0.0) * (n - 1.0) + loss) / n;
            self.avg_gain = Some(ag);
            self.avg_loss = Some(al);
            self.value = Some(Self::rsi_from(ag, al));
        }

        self.prev_price = Some(price);
        self.value
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }

    fn rsi_from(avg_gain: f64, avg_loss: f64) -> f64 {
        if avg_loss == 0.0 {
            return 100.0;
        }
        let rs = avg_gain / avg_loss;
        100.0 - (100.0 / (1.0 + rs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_until_bootstrapped() {
        let mut rsi = Rsi::new(3);
        assert_eq!(rsi.update(100.0), None);
        assert_eq!(rsi.update(101.0), None);
        assert_eq!(rsi.update(102.0), None);
        // 3rd delta completes the bootstrap
        assert!(rsi.update(103.0).is_some());
    }

    #[test]
    fn test_all_gains_is_100() {
        let mut rsi = Rsi::new(5);
        for i in 0..10 {
            rsi.update(100.0 + i as f64);
        }
        assert_eq!(rsi.value(), Some(100.0));
    }

    #[test]
    fn test_within_bounds_on_mixed_path() {
        let mut rsi = Rsi::new(14);
        let prices = [
            44.0, 44.25, 44.5, 43.75, 44.0, 44.5, 45.0, 45.5, 45.25, 45.5, 46.0, 46.5, 46.25,
            46.0, 46.5, 46.75, 46.5,
        ];
        let mut last = None;
        for p in prices {
            last = rsi.update(p);
        }
        let v = last.unwrap();
        assert!(v > 0.0 && v < 100.0);
    }

    #[test]
    fn test_wilder_recurrence() {
        // period 2: deltas +1, +1 bootstrap -> avg_gain 1.0, avg_loss 0.0
        let mut rsi = Rsi::new(2);
        rsi.update(10.0);
        rsi.update(11.0);
        assert_eq!(rsi.update(12.0), Some(100.0));
        // next delta -2: avg_gain=(1*1+0)/2=0.5, avg_loss=(0*1+2)/2=1.0
        let v = rsi.update(10.0).unwrap();
        let expected = 100.0 - 100.0 / (1.0 + 0.5 / 1.0);
        assert!((v - expected).abs() < 1e-9);
    }
}
