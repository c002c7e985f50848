use crate::errors::{Error, Result};
use crate::model::TelemetrySample;

/// Parses a raw telemetry payload. The device is trusted for ranges, so the
/// only rejections are structural: not JSON, a missing field, a wrong type,
/// or an unknown enum value.
pub fn parse_payload(payload: &[u8]) -> Result<TelemetrySample> {
    let sample = serde_json::from_slice::<TelemetrySample>(payload)
        .map_err(|e| Error::MalformedPayload(format!("JSON parse error: {}", e)))?;

    validate(&sample)?;
    Ok(sample)
}

/// Values serde accepts but the log table cannot represent.
pub fn validate(sample: &TelemetrySample) -> Result<()> {
    let numeric = [
        ("river_level", sample.river_level),
        ("tank1_level", sample.tank1_level),
        ("tank2_level", sample.tank2_level),
        ("flow_rate1", sample.flow_rate1),
        ("flow_rate2", sample.flow_rate2),
        ("valve1_state", sample.valve1_state),
        ("valve2_state", sample.valve2_state),
    ];

    for (field, value) in numeric {
        if !value.is_finite() {
            return Err(Error::MalformedPayload(format!(
                "{} is not a finite number",
                field
            )));
        }
    }

    if sample.status.contains('\0') {
        return Err(Error::MalformedPayload(
            "status contains a NUL byte".to_string(),
        ));
    }

    Ok(())
}
