use crate::types::InstrumentError;

/// Exponential moving average; the first update seeds the state with the raw value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ema {
    beta: f64,
    value: Option<f64>,
}

impl Ema {
    pub fn new(beta: f64) -> Result<Self, InstrumentError> {
        if !(beta > 0.0 && beta < 1.0) {
            return Err(InstrumentError::InvalidInput(format!(
                "EMA decay must lie in (0, 1), got {beta}"
            )));
        }
        Ok(Self { beta, value: None })
    }

    pub fn update(&mut self, x: f64) -> f64 {
        let next = match self.value {
            None => x,
            Some(prev) => self.beta * prev + (1.0 - self.beta) * x,
        };
        self.value = Some(next);
        next
    }

    pub fn get(&self) -> Option<f64> {
        self.value
    }

    pub fn is_ready(&self) -> bool {
        self.value.is_some()
    }

    pub fn beta(&self) -> f64 {
        self.beta
    }
}

/// `ema_r <= r_th_eff`, the edge-of-stability guard `eta * max(mu, 0) < 2`
/// (only while curvature is tracked), and the applicability mask.
pub fn trigger_decision(
    ema_r: f64,
    r_th_eff: f64,
    eta: f64,
    mu: f64,
    eigen_enabled: bool,
    mask_applicable: bool,
) -> bool {
    let below = ema_r <= r_th_eff;
    let stable = !eigen_enabled || eta * mu.max(0.0) < 2.0;
    below && stable && mask_applicable
}
