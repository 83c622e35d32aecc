//! Conversão PM2.5 → AQI (tabela EPA).
//!
//! A EPA não define AQI acima de 500 µg/m³. Acima disso o valor cresce
//! linearmente: `aqi(pm) = aqi(500) + (pm - 500)`.

/// Limite superior da tabela EPA usado na extensão linear.
pub const AQI_TABLE_CEILING: f64 = 500.0;

/// Breakpoints PM2.5: (C_low, C_high, I_low, I_high).
const PM25_BREAKPOINTS: [(f64, f64, f64, f64); 7] = [
    (0.0, 12.0, 0.0, 50.0),
    (12.1, 35.4, 51.0, 100.0),
    (35.5, 55.4, 101.0, 150.0),
    (55.5, 150.4, 151.0, 200.0),
    (150.5, 250.4, 201.0, 300.0),
    (250.5, 350.4, 301.0, 400.0),
    (350.5, 500.4, 401.0, 500.0),
];

/// AQI EPA padrão para uma concentração PM2.5 (µg/m³), sem extensão.
///
/// A concentração é truncada em 0.1 antes da interpolação. Valores
/// negativos contam como zero.
pub fn epa_pm25_aqi(pm: f64) -> f64 {
    // epsilon absorve erro de representação (35.4 * 10 = 353.999…)
    let c = ((pm.max(0.0) * 10.0) + 1e-9).floor() / 10.0;

    for &(c_low, c_high, i_low, i_high) in &PM25_BREAKPOINTS {
        if c <= c_high {
            let aqi = (i_high - i_low) / (c_high - c_low) * (c - c_low) + i_low;
            return aqi.round_ties_even();
        }
    }
    500.0
}

/// AQI derivado gravado como `aqi2.5`.
pub fn convert_aqi(pm: f64) -> f64 {
    let extra = (pm - AQI_TABLE_CEILING).max(0.0);
    epa_pm25_aqi(pm.min(AQI_TABLE_CEILING)) + extra
}
