/// One decoded telemetry notification from the monitor
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TelemetryFrame {
    /// The battery voltage in V
    pub voltage_volts: f32,
    /// The state of charge of the battery in %, 0 to 100
    pub soc_percent: u8,
    /// The temperature at the monitor in °C
    pub temperature_celsius: i16,
}

impl std::fmt::Display for TelemetryFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:.2} V, {}%, {} °C",
            self.voltage_volts, self.soc_percent, self.temperature_celsius
        )
    }
}

#[test]
fn test_display() {
    let frame = TelemetryFrame {
        voltage_volts: 12.6,
        soc_percent: 88,
        temperature_celsius: -3,
    };
    assert_eq!(frame.to_string(), "12.60 V, 88%, -3 °C");
}
