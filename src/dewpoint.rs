//! Dew point from temperature and relative humidity.
//!
//! Saturation vapour pressure follows the Wagner–Pruss equation over water;
//! the dew point uses the two-parameter Magnus form with coefficients fitted
//! per temperature band (Vaisala, *Humidity Conversion Formulas*, eq. 1, 3
//! and 7).  Valid from −20 °C to +350 °C.

use crate::error::{Error, Result};

/// Critical pressure of water, hPa.
const PC: f64 = 220_640.0;
/// Critical temperature of water, K.
const TC: f64 = 647.096;
const C: [f64; 6] = [
    -7.85951783,
    1.84408259,
    -11.7866497,
    22.6807411,
    -15.9618719,
    1.80122502,
];

/// `(A, m, Tn)` of the Magnus form for the band containing `temperature`.
fn magnus_coefficients(temperature: f64) -> Option<(f64, f64, f64)> {
    match temperature {
        t if (-20.0..=50.0).contains(&t) => Some((6.116441, 7.591386, 240.7263)),
        t if t > 50.0 && t < 100.0 => Some((6.004918, 7.337936, 229.3975)),
        t if (100.0..=150.0).contains(&t) => Some((5.856548, 7.277310, 225.1033)),
        t if t > 150.0 && t <= 200.0 => Some((6.002859, 7.290361, 227.1704)),
        t if t > 200.0 && t <= 350.0 => Some((9.980622, 7.388931, 263.1239)),
        _ => None,
    }
}

/// Saturation vapour pressure over water at `temperature` °C, in hPa.
pub fn saturation_vapour_pressure(temperature: f64) -> f64 {
    let kelvin = temperature + 273.15;
    let x = 1.0 - kelvin / TC;
    let y = (TC / kelvin)
        * (C[0] * x
            + C[1] * x.powf(1.5)
            + C[2] * x.powi(3)
            + C[3] * x.powf(3.5)
            + C[4] * x.powi(4)
            + C[5] * x.powf(7.5));
    PC * y.exp()
}

/// Dew point in °C for `temperature` °C and `humidity` %RH.
pub fn dewpoint(temperature: f64, humidity: f64) -> Result<f64> {
    let (a, m, tn) = magnus_coefficients(temperature).ok_or_else(|| {
        Error::OutOfRange(format!(
            "temperature={temperature} is not between -20 and +350 degree C"
        ))
    })?;
    if humidity.is_nan() || humidity <= 0.0 {
        return Err(Error::OutOfRange(format!(
            "humidity={humidity} must be greater than 0 %RH"
        )));
    }
    let pw = saturation_vapour_pressure(temperature) * humidity / 100.0;
    Ok(tn / (m / (pw / a).log10() - 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saturation_at_room_temperature() {
        assert!((saturation_vapour_pressure(20.0) - 23.39).abs() < 0.01);
    }

    #[test]
    fn saturated_air_is_at_its_dew_point() {
        for t in [-10.0, 0.0, 20.0, 45.0] {
            let td = dewpoint(t, 100.0).unwrap();
            assert!((td - t).abs() < 0.15, "{t} °C gave {td}");
        }
    }

    #[test]
    fn typical_indoor_air() {
        let td = dewpoint(25.0, 50.0).unwrap();
        assert!((td - 13.86).abs() < 0.05, "{td}");
    }

    #[test]
    fn domain_is_enforced() {
        assert!(matches!(dewpoint(-20.1, 50.0), Err(Error::OutOfRange(_))));
        assert!(matches!(dewpoint(350.1, 50.0), Err(Error::OutOfRange(_))));
        assert!(matches!(dewpoint(20.0, 0.0), Err(Error::OutOfRange(_))));
        assert!(matches!(dewpoint(20.0, f64::NAN), Err(Error::OutOfRange(_))));
        assert!(dewpoint(350.0, 10.0).is_ok());
    }
}
