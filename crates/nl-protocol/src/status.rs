//! Raw device status records as reported by the gateway.
//!
//! Two layouts are seen on the wire:
//! - `status`: the full camelCase register dump (`DeviceStatus`)
//! - `channelStatus.channel`: a reduced summary (`ChannelStatus`)
//!
//! Every field defaults when absent. Values are left in device units;
//! conversion happens in [`crate::telemetry`].

use serde::{Deserialize, Serialize};

/// Full register dump from a `status` reply. All values in device units.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceStatus {
    pub command: i64,
    pub outside_temperature: i64,
    pub special_function_status: i64,
    pub did_reload: i64,
    pub error_code: i64,
    pub sub_error_code: i64,
    pub operation_mode: i64,
    pub operation_busy: i64,
    pub freeze_protection_use: i64,
    pub dhw_use: i64,
    pub dhw_use_sustained: i64,
    pub dhw_temperature: i64,
    pub dhw_temperature_setting: i64,
    pub program_reservation_use: i64,
    pub smart_diagnostic: i64,
    pub fault_status1: i64,
    pub fault_status2: i64,
    pub wifi_rssi: i64,
    pub eco_use: i64,
    pub dhw_target_temperature_setting: i64,
    pub tank_upper_temperature: i64,
    pub tank_lower_temperature: i64,
    pub discharge_temperature: i64,
    pub suction_temperature: i64,
    pub evaporator_temperature: i64,
    pub ambient_temperature: i64,
    pub target_super_heat: i64,
    pub comp_use: i64,
    pub eev_use: i64,
    pub eva_fan_use: i64,
    pub current_inst_power: i64,
    pub shut_off_valve_use: i64,
    pub con_ovr_sensor_use: i64,
    pub wtr_ovr_sensor_use: i64,
    pub dhw_charge_per: i64,
    pub dr_event_status: i64,
    pub vacation_day_setting: i64,
    pub vacation_day_elapsed: i64,
    pub freeze_protection_temperature: i64,
    pub anti_legionella_use: i64,
    pub anti_legionella_period: i64,
    pub anti_legionella_operation_busy: i64,
    pub program_reservation_type: i64,
    pub dhw_operation_setting: i64,
    pub temperature_type: i64,
    pub temp_formula_type: i64,
    pub error_buzzer_use: i64,
    pub current_heat_use: i64,
    pub current_inlet_temperature: i64,
    pub current_statenum: i64,
    pub target_fan_rpm: i64,
    pub current_fan_rpm: i64,
    pub fan_pwm: i64,
    pub dhw_temperature2: i64,
    pub current_dhw_flow_rate: i64,
    pub mixing_rate: i64,
    pub eev_step: i64,
    pub current_super_heat: i64,
    pub heat_upper_use: i64,
    pub heat_lower_use: i64,
    pub scald_use: i64,
    pub air_filter_alarm_use: i64,
    pub air_filter_alarm_period: i64,
    pub air_filter_alarm_elapsed: i64,
    pub cumulated_op_time_eva_fan: i64,
    pub cumulated_dhw_flow_rate: i64,
    pub tou_status: i64,
    pub hp_upper_on_temp_setting: i64,
    pub hp_upper_off_temp_setting: i64,
    pub hp_lower_on_temp_setting: i64,
    pub hp_lower_off_temp_setting: i64,
    pub he_upper_on_temp_setting: i64,
    pub he_upper_off_temp_setting: i64,
    pub he_lower_on_temp_setting: i64,
    pub he_lower_off_temp_setting: i64,
    pub hp_upper_on_diff_temp_setting: i64,
    pub hp_upper_off_diff_temp_setting: i64,
    pub hp_lower_on_diff_temp_setting: i64,
    pub hp_lower_off_diff_temp_setting: i64,
    pub he_upper_on_diff_temp_setting: i64,
    pub he_upper_off_diff_temp_setting: i64,
    // Firmware misspells this key.
    #[serde(rename = "heLowerOnTDiffempSetting", alias = "heLowerOnDiffTempSetting")]
    pub he_lower_on_diff_temp_setting: i64,
    pub he_lower_off_diff_temp_setting: i64,
    pub dr_override_status: i64,
    pub tou_override_status: i64,
    pub total_energy_capacity: i64,
    pub available_energy_capacity: i64,
}

/// Reduced `channelStatus.channel` summary sent by some firmware.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelStatus {
    #[serde(rename = "dhwChargePercent")]
    pub dhw_charge_percent: i64,
    #[serde(rename = "avgOutletTemp")]
    pub avg_outlet_temp: i64,
    #[serde(rename = "DHWSettingTemp")]
    pub dhw_setting_temp: i64,
    #[serde(rename = "outsideTemp")]
    pub outside_temp: i64,
    #[serde(rename = "powerStatus")]
    pub power_status: bool,
    #[serde(rename = "heatPumpStatus")]
    pub heat_pump_status: bool,
    #[serde(rename = "resistanceHeaterStatus")]
    pub resistance_heater_status: bool,
    #[serde(rename = "heating")]
    pub heating: bool,
    #[serde(rename = "freezeProtection")]
    pub freeze_protection: bool,
    #[serde(rename = "onDemandUseFlag")]
    pub on_demand_use: bool,
    #[serde(rename = "ecoMode")]
    pub eco_mode: bool,
    #[serde(rename = "defrostMode")]
    pub defrost_mode: bool,
    #[serde(rename = "errorCodePrimary")]
    pub error_code_primary: i64,
    #[serde(rename = "errorCodeSecondary")]
    pub error_code_secondary: i64,
    #[serde(rename = "wifiRssi")]
    pub wifi_rssi: i64,
}

/// Operation-mode register values the channel summary maps onto.
const MODE_STANDBY: i64 = 0;
const MODE_HEAT_PUMP: i64 = 32;
const MODE_ELECTRIC: i64 = 33;
const MODE_HYBRID: i64 = 34;

impl ChannelStatus {
    /// Operation-mode register value implied by the active components.
    pub fn operation_mode(&self) -> i64 {
        if !self.power_status {
            return MODE_STANDBY;
        }
        match (self.heat_pump_status, self.resistance_heater_status) {
            (true, true) => MODE_HYBRID,
            (false, true) => MODE_ELECTRIC,
            (true, false) => MODE_HEAT_PUMP,
            (false, false) => MODE_STANDBY,
        }
    }

    /// Project the summary onto the full record; absent registers stay 0.
    pub fn to_device_status(&self) -> DeviceStatus {
        DeviceStatus {
            outside_temperature: self.outside_temp,
            error_code: self.error_code_primary,
            sub_error_code: self.error_code_secondary,
            operation_mode: self.operation_mode(),
            operation_busy: self.heating.into(),
            freeze_protection_use: self.freeze_protection.into(),
            dhw_use: self.on_demand_use.into(),
            dhw_temperature: self.avg_outlet_temp,
            dhw_temperature_setting: self.dhw_setting_temp,
            dhw_target_temperature_setting: self.dhw_setting_temp,
            dhw_charge_per: self.dhw_charge_percent,
            wifi_rssi: self.wifi_rssi,
            eco_use: self.eco_mode.into(),
            comp_use: self.heat_pump_status.into(),
            heat_upper_use: self.resistance_heater_status.into(),
            ..DeviceStatus::default()
        }
    }
}
