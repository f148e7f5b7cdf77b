//! FFI Bindings for the J2534 PassThru Library
//!
//! Safe wrapper around the vendor `PassThru*` C functions, linked at build
//! time by the crate build script.

use super::{FilterType, PassThruApi, PassThruMsg, PassThruVersion, ioctl};
use crate::error::PassThruStatus;
use libc::{c_char, c_long, c_ulong, c_void};
use std::ffi::{CStr, CString};
use std::ptr;
use tracing::debug;

/// Largest data field of a PASSTHRU_MSG
const MAX_DATA: usize = 4128;
/// Size of each PassThruReadVersion string buffer
const VERSION_LEN: usize = 80;

/// C layout of PASSTHRU_MSG
#[repr(C)]
#[derive(Clone, Copy)]
pub struct CPassThruMsg {
    pub protocol_id: c_ulong,
    pub rx_status: c_ulong,
    pub tx_flags: c_ulong,
    pub timestamp: c_ulong,
    pub data_size: c_ulong,
    pub extra_data_index: c_ulong,
    pub data: [u8; MAX_DATA],
}

impl CPassThruMsg {
    fn empty() -> Self {
        Self {
            protocol_id: 0,
            rx_status: 0,
            tx_flags: 0,
            timestamp: 0,
            data_size: 0,
            extra_data_index: 0,
            data: [0; MAX_DATA],
        }
    }

    fn from_msg(msg: &PassThruMsg) -> Result<Self, PassThruStatus> {
        if msg.data.len() > MAX_DATA {
            return Err(PassThruStatus::BufferFull);
        }
        let mut out = Self::empty();
        out.protocol_id = msg.protocol_id as c_ulong;
        out.tx_flags = msg.tx_flags as c_ulong;
        out.data_size = msg.data.len() as c_ulong;
        out.data[..msg.data.len()].copy_from_slice(&msg.data);
        Ok(out)
    }

    fn to_msg(&self) -> PassThruMsg {
        let len = (self.data_size as usize).min(MAX_DATA);
        PassThruMsg {
            protocol_id: self.protocol_id as u32,
            rx_status: self.rx_status as u32,
            tx_flags: self.tx_flags as u32,
            timestamp: self.timestamp as u32,
            data: self.data[..len].to_vec(),
        }
    }
}

/// C layout of SCONFIG
#[repr(C)]
struct CConfig {
    parameter: c_ulong,
    value: c_ulong,
}

/// C layout of SCONFIG_LIST
#[repr(C)]
struct CConfigList {
    num_of_params: c_ulong,
    config_ptr: *mut CConfig,
}

extern "C" {
    fn PassThruOpen(name: *const c_void, device_id: *mut c_ulong) -> c_long;
    fn PassThruClose(device_id: c_ulong) -> c_long;
    fn PassThruConnect(
        device_id: c_ulong,
        protocol_id: c_ulong,
        flags: c_ulong,
        baud_rate: c_ulong,
        channel_id: *mut c_ulong,
    ) -> c_long;
    fn PassThruDisconnect(channel_id: c_ulong) -> c_long;
    fn PassThruReadMsgs(
        channel_id: c_ulong,
        msgs: *mut CPassThruMsg,
        num_msgs: *mut c_ulong,
        timeout: c_ulong,
    ) -> c_long;
    fn PassThruWriteMsgs(
        channel_id: c_ulong,
        msgs: *mut CPassThruMsg,
        num_msgs: *mut c_ulong,
        timeout: c_ulong,
    ) -> c_long;
    fn PassThruStartMsgFilter(
        channel_id: c_ulong,
        filter_type: c_ulong,
        mask: *mut CPassThruMsg,
        pattern: *mut CPassThruMsg,
        flow_control: *mut CPassThruMsg,
        filter_id: *mut c_ulong,
    ) -> c_long;
    fn PassThruIoctl(
        id: c_ulong,
        ioctl_id: c_ulong,
        input: *mut c_void,
        output: *mut c_void,
    ) -> c_long;
    fn PassThruReadVersion(
        device_id: c_ulong,
        firmware: *mut c_char,
        dll: *mut c_char,
        api: *mut c_char,
    ) -> c_long;
}

fn check(ret: c_long) -> Result<(), PassThruStatus> {
    match ret {
        0 => Ok(()),
        code => Err(PassThruStatus::from(code as u32)),
    }
}

fn version_string(buf: &[c_char; VERSION_LEN]) -> String {
    // SAFETY: the library NUL-terminates within the 80-byte buffer; the
    // last byte is forced to zero before this is called
    unsafe { CStr::from_ptr(buf.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}

/// The linked vendor library
#[derive(Debug, Default, Clone, Copy)]
pub struct NativePassThru;

impl PassThruApi for NativePassThru {
    fn open(&self, name: Option<&str>) -> Result<u32, PassThruStatus> {
        let name = name
            .map(CString::new)
            .transpose()
            .map_err(|_| PassThruStatus::NullParameter)?;
        let name_ptr = name
            .as_ref()
            .map_or(ptr::null(), |n| n.as_ptr() as *const c_void);
        let mut device_id: c_ulong = 0;
        // SAFETY: name outlives the call; device_id is a valid out pointer
        check(unsafe { PassThruOpen(name_ptr, &mut device_id) })?;
        debug!("PassThruOpen -> device {}", device_id);
        Ok(device_id as u32)
    }

    fn close(&self, device_id: u32) -> Result<(), PassThruStatus> {
        // SAFETY: plain value argument
        check(unsafe { PassThruClose(device_id as c_ulong) })
    }

    fn connect(
        &self,
        device_id: u32,
        protocol_id: u32,
        flags: u32,
        baud_rate: u32,
    ) -> Result<u32, PassThruStatus> {
        let mut channel_id: c_ulong = 0;
        // SAFETY: channel_id is a valid out pointer
        check(unsafe {
            PassThruConnect(
                device_id as c_ulong,
                protocol_id as c_ulong,
                flags as c_ulong,
                baud_rate as c_ulong,
                &mut channel_id,
            )
        })?;
        Ok(channel_id as u32)
    }

    fn disconnect(&self, channel_id: u32) -> Result<(), PassThruStatus> {
        // SAFETY: plain value argument
        check(unsafe { PassThruDisconnect(channel_id as c_ulong) })
    }

    fn read_msgs(
        &self,
        channel_id: u32,
        max_msgs: usize,
        timeout_ms: u32,
    ) -> Result<Vec<PassThruMsg>, PassThruStatus> {
        let mut buf = vec![CPassThruMsg::empty(); max_msgs.max(1)];
        let mut count = buf.len() as c_ulong;
        // SAFETY: buf holds `count` messages and count is a valid pointer
        let ret = unsafe {
            PassThruReadMsgs(
                channel_id as c_ulong,
                buf.as_mut_ptr(),
                &mut count,
                timeout_ms as c_ulong,
            )
        };
        // A timeout may still have delivered some messages
        if ret != 0 && count == 0 {
            check(ret)?;
        }
        buf.truncate((count as usize).min(buf.len()));
        Ok(buf.iter().map(CPassThruMsg::to_msg).collect())
    }

    fn write_msgs(
        &self,
        channel_id: u32,
        msgs: &[PassThruMsg],
        timeout_ms: u32,
    ) -> Result<usize, PassThruStatus> {
        let mut buf = msgs
            .iter()
            .map(CPassThruMsg::from_msg)
            .collect::<Result<Vec<_>, _>>()?;
        let mut count = buf.len() as c_ulong;
        // SAFETY: buf holds `count` messages and count is a valid pointer
        check(unsafe {
            PassThruWriteMsgs(
                channel_id as c_ulong,
                buf.as_mut_ptr(),
                &mut count,
                timeout_ms as c_ulong,
            )
        })?;
        Ok(count as usize)
    }

    fn start_msg_filter(
        &self,
        channel_id: u32,
        filter: FilterType,
        mask: &PassThruMsg,
        pattern: &PassThruMsg,
    ) -> Result<u32, PassThruStatus> {
        let mut mask = CPassThruMsg::from_msg(mask)?;
        let mut pattern = CPassThruMsg::from_msg(pattern)?;
        let mut filter_id: c_ulong = 0;
        // SAFETY: all pointers are valid for the call; no flow control
        // message is needed for pass filters
        check(unsafe {
            PassThruStartMsgFilter(
                channel_id as c_ulong,
                filter as c_ulong,
                &mut mask,
                &mut pattern,
                ptr::null_mut(),
                &mut filter_id,
            )
        })?;
        Ok(filter_id as u32)
    }

    fn ioctl(&self, id: u32, ioctl_id: u32) -> Result<u32, PassThruStatus> {
        let mut value: c_ulong = 0;
        // SAFETY: value-returning ioctls take no input and one c_ulong output
        check(unsafe {
            PassThruIoctl(
                id as c_ulong,
                ioctl_id as c_ulong,
                ptr::null_mut(),
                &mut value as *mut c_ulong as *mut c_void,
            )
        })?;
        Ok(value as u32)
    }

    fn set_config(&self, channel_id: u32, params: &[(u32, u32)]) -> Result<(), PassThruStatus> {
        let mut entries: Vec<CConfig> = params
            .iter()
            .map(|&(parameter, value)| CConfig {
                parameter: parameter as c_ulong,
                value: value as c_ulong,
            })
            .collect();
        let mut list = CConfigList {
            num_of_params: entries.len() as c_ulong,
            config_ptr: entries.as_mut_ptr(),
        };
        // SAFETY: list points at `entries`, which outlives the call
        check(unsafe {
            PassThruIoctl(
                channel_id as c_ulong,
                ioctl::SET_CONFIG as c_ulong,
                &mut list as *mut CConfigList as *mut c_void,
                ptr::null_mut(),
            )
        })
    }

    fn read_version(&self, device_id: u32) -> Result<PassThruVersion, PassThruStatus> {
        let mut firmware = [0 as c_char; VERSION_LEN];
        let mut dll = [0 as c_char; VERSION_LEN];
        let mut api = [0 as c_char; VERSION_LEN];
        // SAFETY: each buffer is the 80 bytes the API requires
        check(unsafe {
            PassThruReadVersion(
                device_id as c_ulong,
                firmware.as_mut_ptr(),
                dll.as_mut_ptr(),
                api.as_mut_ptr(),
            )
        })?;
        for buf in [&mut firmware, &mut dll, &mut api] {
            buf[VERSION_LEN - 1] = 0;
        }
        Ok(PassThruVersion {
            firmware: version_string(&firmware),
            dll: version_string(&dll),
            api: version_string(&api),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_layout_round_trip() {
        let msg = PassThruMsg::new(5, 0x100, vec![0x18, 0xDB, 0x33, 0xF1, 0x01, 0x00]);
        let c = CPassThruMsg::from_msg(&msg).unwrap();
        assert_eq!(c.data_size, 6);
        assert_eq!(c.to_msg(), msg);
    }

    #[test]
    fn test_oversized_message_rejected() {
        let msg = PassThruMsg::new(5, 0, vec![0; MAX_DATA + 1]);
        assert!(CPassThruMsg::from_msg(&msg).is_err());
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(check(0), Ok(()));
        assert_eq!(check(0x08), Err(PassThruStatus::BufferFull));
    }
}
