//! `server.ini` parsing and validation.
//!
//! Parsing itself is delegated to the `ini` crate; every field and
//! validation rule here follows the original `Config`/`ConfigVerifier`
//! pair exactly (same error conditions, same defaults-are-not-allowed
//! stance — a missing or malformed key aborts startup).

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use ini::Ini;

/// A wall-clock time of day, `HH:MM:SS`, parsed and validated the way the
/// source's `datetime.strptime(..., "%H:%M:%S")` does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeOfDay {
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl TimeOfDay {
    pub fn seconds_since_midnight(self) -> u32 {
        self.hour as u32 * 3600 + self.minute as u32 * 60 + self.second as u32
    }
}

impl FromStr for TimeOfDay {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.splitn(3, ':');
        let (Some(h), Some(m), Some(sec), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            bail!("not in HH:MM:SS form: {s:?}");
        };
        let hour: u8 = h.parse().with_context(|| format!("bad hour in {s:?}"))?;
        let minute: u8 = m.parse().with_context(|| format!("bad minute in {s:?}"))?;
        let second: u8 = sec.parse().with_context(|| format!("bad second in {s:?}"))?;
        if hour > 23 || minute > 59 || second > 59 {
            bail!("time of day out of range: {s:?}");
        }
        Ok(TimeOfDay {
            hour,
            minute,
            second,
        })
    }
}

/// `ClientStoppingPoint` additionally restricts the hour to the
/// `(?:[01][0-9]|2[0-3])` pattern from the source's regex (equivalent to a
/// plain 0-23 range, but kept as a separate parse step so the error message
/// matches the field it names).
fn parse_client_stopping_point(s: &str) -> Result<Option<TimeOfDay>> {
    if s == "None" {
        return Ok(None);
    }
    let t: TimeOfDay = s
        .parse()
        .with_context(|| format!("bad ClientStoppingPoint {s:?}"))?;
    Ok(Some(t))
}

/// `VideoCutTime` additionally forbids exactly midnight (the source treats
/// `00:00:00` as a configuration error, not "disabled" — `"None"` is the
/// spelling for disabled).
fn parse_video_cut_time(s: &str) -> Result<Option<TimeOfDay>> {
    if s == "None" {
        return Ok(None);
    }
    if s == "00:00:00" {
        bail!("VideoCutTime may not be 00:00:00; use None to disable cutting");
    }
    let t: TimeOfDay = s.parse().with_context(|| format!("bad VideoCutTime {s:?}"))?;
    Ok(Some(t))
}

fn check_port(port: i64, field: &str) -> Result<u16> {
    if !(1..=65535).contains(&port) {
        bail!("{field} must be in [1, 65535], got {port}");
    }
    Ok(port as u16)
}

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

#[derive(Debug, Clone)]
pub struct Config {
    pub debug_mode: bool,
    pub server_ip: Ipv4Addr,
    pub server_port: u16,
    pub client_stopping_point: Option<TimeOfDay>,
    pub default_height: u16,
    pub default_width: u16,
    pub ffmpeg_output_file_options: String,
    pub output_file_extension: String,
    pub video_cut_time: Option<TimeOfDay>,
    pub concat_amount: u32,
    pub storage_path: PathBuf,
    pub free_storage_amount_before_deleting: u64,
    pub consecutive_ffmpeg_threads: u32,
    pub webserver_host: Ipv4Addr,
    pub webserver_port: u16,
    pub webserver_table_width: u32,
}

impl Config {
    pub fn load(path: &std::path::Path) -> Result<Config> {
        let ini = Ini::load_from_file(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Config::from_ini(&ini)
    }

    fn from_ini(ini: &Ini) -> Result<Config> {
        let developer = section(ini, "DEVELOPER")?;
        let debug_mode = get_bool(developer, "DEVELOPER", "DebugMode")?;

        let network = section(ini, "Network")?;
        let server_ip: Ipv4Addr = get(network, "Network", "ServerIP")?
            .parse()
            .context("bad ServerIP")?;
        let server_port = check_port(get_int(network, "Network", "ServerPort")?, "ServerPort")?;
        let client_stopping_point =
            parse_client_stopping_point(get(network, "Network", "ClientStoppingPoint")?)?;

        let video = section(ini, "Video")?;
        let default_height: i64 = get_int(video, "Video", "DefaultHeight")?;
        let default_width: i64 = get_int(video, "Video", "DefaultWidth")?;
        if default_height < 0 {
            bail!("DefaultHeight may not be negative");
        }
        if default_width < 0 {
            bail!("DefaultWidth may not be negative");
        }
        let ffmpeg_output_file_options = get(video, "Video", "FFMPEGOutputFileOptions")?
            .trim()
            .to_string();
        if ffmpeg_output_file_options.contains("&&") {
            bail!("FFMPEGOutputFileOptions may not contain '&&'");
        }
        let output_file_extension = get(video, "Video", "OutputFileExtension")?.to_string();
        let video_cut_time = parse_video_cut_time(get(video, "Video", "VideoCutTime")?)?;
        let concat_amount = get_int(video, "Video", "ConcatAmount")?;
        if concat_amount < 1 {
            bail!("ConcatAmount must be >= 1");
        }

        let storage = section(ini, "Storage")?;
        let storage_path = PathBuf::from(get(storage, "Storage", "StoragePath")?);
        if !storage_path.is_dir() {
            bail!("StoragePath {} does not exist", storage_path.display());
        }
        let free_storage_amount_before_deleting =
            get_int(storage, "Storage", "FreeStorageAmountBeforeDeleting")?;
        if free_storage_amount_before_deleting <= 0 {
            bail!("FreeStorageAmountBeforeDeleting must be > 0");
        }

        let processes = section(ini, "Processes")?;
        let consecutive_ffmpeg_threads = get_int(processes, "Processes", "ConsecutiveFFMPEGThreads")?;
        if consecutive_ffmpeg_threads <= 0 {
            bail!("ConsecutiveFFMPEGThreads must be > 0");
        }

        let webserver = section(ini, "Webserver")?;
        let webserver_host: Ipv4Addr = get(webserver, "Webserver", "WebserverHost")?
            .parse()
            .context("bad WebserverHost")?;
        let webserver_port = check_port(
            get_int(webserver, "Webserver", "WebserverPort")?,
            "WebserverPort",
        )?;
        let webserver_table_width = get_int(webserver, "Webserver", "WebserverTableWidth")?;
        if webserver_table_width < 1 {
            bail!("WebserverTableWidth must be >= 1");
        }

        Ok(Config {
            debug_mode,
            server_ip,
            server_port,
            client_stopping_point,
            default_height: default_height as u16,
            default_width: default_width as u16,
            ffmpeg_output_file_options,
            output_file_extension,
            video_cut_time,
            concat_amount: concat_amount as u32,
            storage_path,
            free_storage_amount_before_deleting: free_storage_amount_before_deleting as u64,
            consecutive_ffmpeg_threads: consecutive_ffmpeg_threads as u32,
            webserver_host,
            webserver_port,
            webserver_table_width: webserver_table_width as u32,
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
            .set("ClientStoppingPoint", "None");
        ini.with_section(Some("Video"))
            .set("DefaultHeight", "480")
            .set("DefaultWidth", "640")
            .set("FFMPEGOutputFileOptions", "-preset veryfast")
            .set("OutputFileExtension", ".mp4")
            .set("VideoCutTime", "None")
            .set("ConcatAmount", "3");
        ini.with_section(Some("Storage"))
            .set("StoragePath", "/tmp")
            .set("FreeStorageAmountBeforeDeleting", "1000000");
        ini.with_section(Some("Processes")).set("ConsecutiveFFMPEGThreads", "2");
        ini.with_section(Some("Webserver"))
            .set("WebserverHost", "0.0.0.0")
            .set("WebserverPort", "8080")
            .set("WebserverTableWidth", "3");
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
        let text = sample(&[]);
        let cfg = load(&text).unwrap();
        assert_eq!(cfg.concat_amount, 3);
        assert_eq!(cfg.video_cut_time, None);
    }

    #[test]
    fn video_cut_time_of_midnight_is_rejected() {
        let text = sample(&[("Video", "VideoCutTime", "00:00:00")]);
        assert!(load(&text).is_err());
    }

    #[test]
    fn ffmpeg_options_reject_double_ampersand() {
        let text = sample(&[("Video", "FFMPEGOutputFileOptions", "-x && rm -rf /")]);
        assert!(load(&text).is_err());
    }

    #[test]
    fn concat_amount_must_be_positive() {
        let text = sample(&[("Video", "ConcatAmount", "0")]);
        assert!(load(&text).is_err());
    }

    #[test]
    fn client_stopping_point_accepts_none() {
        let text = sample(&[("Network", "ClientStoppingPoint", "None")]);
        assert_eq!(load(&text).unwrap().client_stopping_point, None);
    }

    #[test]
    fn client_stopping_point_parses_time() {
        let text = sample(&[("Network", "ClientStoppingPoint", "23:59:59")]);
        assert_eq!(
            load(&text).unwrap().client_stopping_point,
            Some(TimeOfDay {
                hour: 23,
                minute: 59,
                second: 59
            })
        );
    }

    #[test]
    fn storage_path_must_exist() {
        let text = sample(&[("Storage", "StoragePath", "/no/such/dir/vigil-test")]);
        assert!(load(&text).is_err());
    }

    #[test]
    fn port_out_of_range_is_rejected() {
        let text = sample(&[("Network", "ServerPort", "70000")]);
        assert!(load(&text).is_err());
    }
}
