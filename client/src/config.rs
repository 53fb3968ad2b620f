//! `client.ini` parsing and validation. Same validation stance as the
//! server's config: every field is required, invalid values abort startup.
//! Grounded on `original_source/src/client/Config.py`.

use std::net::Ipv4Addr;

use anyhow::{bail, Context, Result};
use ini::Ini;

fn section<'a>(ini: &'a Ini, name: &str) -> Result<&'a ini::Properties> {
    ini.section(Some(name))
        .with_context(|| format!("missing [{name}] section"))
}

fn get<'a>(props: &'a ini::Properties, section: &str, key: &str) -> Result<&'a str> {
    props
        .get(key)
        .with_context(|| format!("missing {key} in [{section}]"))
}

fn get_bool(props: &ini::Properties, section: &str, key: &str) -> Result<bool> {
    let raw = get(props, section, key)?;
    raw.parse()
        .with_context(|| format!("[{section}] {key} must be true/false, got {raw:?}"))
}

fn get_int(props: &ini::Properties, section: &str, key: &str) -> Result<i64> {
    let raw = get(props, section, key)?;
    raw.parse()
        .with_context(|| format!("[{section}] {key} must be an integer, got {raw:?}"))
}

fn get_float(props: &ini::Properties, section: &str, key: &str) -> Result<f64> {
    let raw = get(props, section, key)?;
    raw.parse()
        .with_context(|| format!("[{section}] {key} must be a number, got {raw:?}"))
}

#[derive(Debug, Clone)]
pub struct Config {
    pub debug_mode: bool,
    pub server_ip: Ipv4Addr,
    pub server_port: u16,
    pub wait_after_frame: f64,
    /// Seconds to keep retrying a reconnect after a server crash; 0 disables
    /// retrying (the client exits immediately on control-connection EOF).
    pub retry_after_server_crash: u64,
    pub capture_device: u32,
    pub use_custom_resolution: bool,
    pub custom_frame_height: u16,
    pub custom_frame_width: u16,
}

impl Config {
    pub fn load(path: &std::path::Path) -> Result<Config> {
        let ini = Ini::load_from_file(path).with_context(|| format!("reading {}", path.display()))?;
        Config::from_ini(&ini)
    }

    fn from_ini(ini: &Ini) -> Result<Config> {
        let developer = section(ini, "DEVELOPER")?;
        let debug_mode = get_bool(developer, "DEVELOPER", "DebugMode")?;

        let network = section(ini, "Network")?;
        let server_ip: Ipv4Addr = get(network, "Network", "ServerIP")?
            .parse()
            .context("bad ServerIP")?;
        let server_port = get_int(network, "Network", "ServerPort")?;
        if !(1..=65535).contains(&server_port) {
            bail!("ServerPort must be in [1, 65535], got {server_port}");
        }
        let wait_after_frame = get_float(network, "Network", "WaitAfterFrame")?;
        if wait_after_frame < 0.0 {
            bail!("WaitAfterFrame must not be negative");
        }
        let retry_after_server_crash = get_int(network, "Network", "RetryAfterServerCrash")?;
        if retry_after_server_crash < 0 {
            bail!("RetryAfterServerCrash must not be negative");
        }

        let capture = section(ini, "VideoCapture")?;
        let capture_device = get_int(capture, "VideoCapture", "CaptureDevice")?;
        if capture_device < 0 {
            bail!("CaptureDevice must not be negative");
        }
        let use_custom_resolution = get_bool(capture, "VideoCapture", "UseCustomResolution")?;
        let custom_frame_height = get_int(capture, "VideoCapture", "CustomFrameHeight")?;
        let custom_frame_width = get_int(capture, "VideoCapture", "CustomFrameWidth")?;
        if custom_frame_height < 0 {
            bail!("CustomFrameHeight must not be negative");
        }
        if custom_frame_width < 0 {
            bail!("CustomFrameWidth must not be negative");
        }

        Ok(Config {
            debug_mode,
            server_ip,
            server_port: server_port as u16,
            wait_after_frame,
            retry_after_server_crash: retry_after_server_crash as u64,
            capture_device: capture_device as u32,
            use_custom_resolution,
            custom_frame_height: custom_frame_height as u16,
            custom_frame_width: custom_frame_width as u16,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(overrides: &[(&str, &str, &str)]) -> String {
        let mut ini = Ini::new();
        ini.with_section(Some("DEVELOPER")).set("DebugMode", "false");
        ini.with_section(Some("Network"))
            .set("ServerIP", "127.0.0.1")
            .set("ServerPort", "9999")
            .set("WaitAfterFrame", "0.0")
            .set("RetryAfterServerCrash", "30");
        ini.with_section(Some("VideoCapture"))
            .set("CaptureDevice", "0")
            .set("UseCustomResolution", "false")
            .set("CustomFrameHeight", "0")
            .set("CustomFrameWidth", "0");
        for (sec, key, val) in overrides {
            ini.with_section(Some(*sec)).set(*key, *val);
        }
        let mut out = Vec::new();
        ini.write_to(&mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    fn load(text: &str) -> Result<Config> {
        let ini = Ini::load_from_str(text)?;
        Config::from_ini(&ini)
    }

    #[test]
    fn valid_config_loads() {
        let cfg = load(&sample(&[])).unwrap();
        assert_eq!(cfg.server_port, 9999);
        assert_eq!(cfg.retry_after_server_crash, 30);
    }

    #[test]
    fn retry_after_server_crash_zero_is_allowed() {
        let cfg = load(&sample(&[("Network", "RetryAfterServerCrash", "0")])).unwrap();
        assert_eq!(cfg.retry_after_server_crash, 0);
    }

    #[test]
    fn negative_wait_after_frame_is_rejected() {
        assert!(load(&sample(&[("Network", "WaitAfterFrame", "-1.0")])).is_err());
    }

    #[test]
    fn port_out_of_range_is_rejected() {
        assert!(load(&sample(&[("Network", "ServerPort", "0")])).is_err());
    }

    #[test]
    fn negative_custom_frame_height_is_rejected() {
        assert!(load(&sample(&[("VideoCapture", "CustomFrameHeight", "-5")])).is_err());
    }
}
