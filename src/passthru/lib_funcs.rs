//! Dynamic binding against a vendor PassThru (SAE J2534 v04.04) function
//! library. Entry points use the `system` ABI: stdcall on 32-bit Windows as
//! the J2534 specification demands, the platform default elsewhere.

use std::ffi::{c_char, c_void};
use std::fmt;
use std::sync::Arc;

use j2534_rust::{FilterType, IoctlID, PASSTHRU_MSG, PassthruError, Protocol};
use libloading::Library;

/// Result carrying a raw PassThru status in its Err variant
pub type PassthruResult<T> = Result<T, PassthruError>;

type PassThruOpenFn = unsafe extern "system" fn(name: *const c_void, device_id: *mut u32) -> i32;
type PassThruCloseFn = unsafe extern "system" fn(device_id: u32) -> i32;
type PassThruConnectFn = unsafe extern "system" fn(
    device_id: u32,
    protocol_id: u32,
    flags: u32,
    baudrate: u32,
    channel_id: *mut u32,
) -> i32;
type PassThruDisconnectFn = unsafe extern "system" fn(channel_id: u32) -> i32;
type PassThruReadMsgsFn = unsafe extern "system" fn(
    channel_id: u32,
    msgs: *mut PASSTHRU_MSG,
    num_msgs: *mut u32,
    timeout: u32,
) -> i32;
type PassThruWriteMsgsFn = unsafe extern "system" fn(
    channel_id: u32,
    msgs: *mut PASSTHRU_MSG,
    num_msgs: *mut u32,
    timeout: u32,
) -> i32;
type PassThruStartMsgFilterFn = unsafe extern "system" fn(
    channel_id: u32,
    filter_type: u32,
    m_msg: *const PASSTHRU_MSG,
    p_msg: *const PASSTHRU_MSG,
    fc_msg: *const PASSTHRU_MSG,
    filter_id: *mut u32,
) -> i32;
type PassThruStopMsgFilterFn = unsafe extern "system" fn(channel_id: u32, filter_id: u32) -> i32;
type PassThruReadVersionFn = unsafe extern "system" fn(
    device_id: u32,
    firmware_version: *mut c_char,
    dll_version: *mut c_char,
    api_version: *mut c_char,
) -> i32;
type PassThruGetLastErrorFn = unsafe extern "system" fn(error_description: *mut c_char) -> i32;
type PassThruIoctlFn = unsafe extern "system" fn(
    handle_id: u32,
    ioctl_id: u32,
    input: *mut c_void,
    output: *mut c_void,
) -> i32;

/// Version strings reported by the adapter driver
#[derive(Debug, Clone)]
pub struct DrvVersion {
    /// Library (DLL) version
    pub dll_version: String,
    /// PassThru API version
    pub api_version: String,
    /// Device firmware version
    pub fw_version: String,
}

/// Loaded vendor library with all entry points resolved
#[derive(Clone)]
pub struct PassthruDrv {
    lib: Arc<Library>,
    open_fn: PassThruOpenFn,
    close_fn: PassThruCloseFn,
    connect_fn: PassThruConnectFn,
    disconnect_fn: PassThruDisconnectFn,
    read_msg_fn: PassThruReadMsgsFn,
    write_msg_fn: PassThruWriteMsgsFn,
    start_filter_fn: PassThruStartMsgFilterFn,
    stop_filter_fn: PassThruStopMsgFilterFn,
    read_version_fn: PassThruReadVersionFn,
    get_last_err_fn: PassThruGetLastErrorFn,
    ioctl_fn: PassThruIoctlFn,
}

impl fmt::Debug for PassthruDrv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PassthruDrv")
            .field("library", &self.lib)
            .finish()
    }
}

#[inline(always)]
fn ret_res<T>(res: i32, ret: T) -> PassthruResult<T> {
    match res {
        0 => Ok(ret),
        _ => {
            log::error!("PassThru call failed with status 0x{res:02X}");
            Err(PassthruError::try_from(res as u32).unwrap_or(PassthruError::ERR_FAILED))
        }
    }
}

/// Converts a fixed NUL-terminated C buffer into a String
fn c_buf_to_string(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).to_string()
}

impl PassthruDrv {
    /// Loads the vendor library at `path` and resolves every entry point
    pub fn load_lib(path: &str) -> Result<Self, libloading::Error> {
        log::debug!("loading PassThru function library {path}");
        let lib = unsafe { Library::new(path)? };
        unsafe {
            let open_fn = *lib.get::<PassThruOpenFn>(b"PassThruOpen\0")?.into_raw();
            let close_fn = *lib.get::<PassThruCloseFn>(b"PassThruClose\0")?.into_raw();
            let connect_fn = *lib
                .get::<PassThruConnectFn>(b"PassThruConnect\0")?
                .into_raw();
            let disconnect_fn = *lib
                .get::<PassThruDisconnectFn>(b"PassThruDisconnect\0")?
                .into_raw();
            let read_msg_fn = *lib
                .get::<PassThruReadMsgsFn>(b"PassThruReadMsgs\0")?
                .into_raw();
            let write_msg_fn = *lib
                .get::<PassThruWriteMsgsFn>(b"PassThruWriteMsgs\0")?
                .into_raw();
            let start_filter_fn = *lib
                .get::<PassThruStartMsgFilterFn>(b"PassThruStartMsgFilter\0")?
                .into_raw();
            let stop_filter_fn = *lib
                .get::<PassThruStopMsgFilterFn>(b"PassThruStopMsgFilter\0")?
                .into_raw();
            let read_version_fn = *lib
                .get::<PassThruReadVersionFn>(b"PassThruReadVersion\0")?
                .into_raw();
            let get_last_err_fn = *lib
                .get::<PassThruGetLastErrorFn>(b"PassThruGetLastError\0")?
                .into_raw();
            let ioctl_fn = *lib.get::<PassThruIoctlFn>(b"PassThruIoctl\0")?.into_raw();

            Ok(PassthruDrv {
                lib: Arc::new(lib),
                open_fn,
                close_fn,
                connect_fn,
                disconnect_fn,
                read_msg_fn,
                write_msg_fn,
                start_filter_fn,
                stop_filter_fn,
                read_version_fn,
                get_last_err_fn,
                ioctl_fn,
            })
        }
    }

    /// PassThruOpen. Returns the device ID
    pub fn open(&self) -> PassthruResult<u32> {
        log::debug!("PT_OPEN called");
        let mut id: u32 = 0;
        let res = unsafe { (self.open_fn)(std::ptr::null(), &mut id) };
        ret_res(res, id)
    }

    /// PassThruClose
    pub fn close(&self, dev_id: u32) -> PassthruResult<()> {
        log::debug!("PT_CLOSE called, device ID {dev_id}");
        ret_res(unsafe { (self.close_fn)(dev_id) }, ())
    }

    /// PassThruConnect. Returns the channel ID
    pub fn connect(
        &self,
        dev_id: u32,
        protocol: Protocol,
        flags: u32,
        baud: u32,
    ) -> PassthruResult<u32> {
        log::debug!(
            "PT_CONNECT called, device ID {dev_id}, protocol {protocol}, flags {flags:08X}, baud {baud}"
        );
        let mut channel_id: u32 = 0;
        let res = unsafe { (self.connect_fn)(dev_id, protocol as u32, flags, baud, &mut channel_id) };
        ret_res(res, channel_id)
    }

    /// PassThruDisconnect
    pub fn disconnect(&self, channel_id: u32) -> PassthruResult<()> {
        log::debug!("PT_DISCONNECT called, channel ID {channel_id}");
        ret_res(unsafe { (self.disconnect_fn)(channel_id) }, ())
    }

    /// PassThruWriteMsgs. Returns the number of messages written
    pub fn write_messages(
        &self,
        channel_id: u32,
        msgs: &mut [PASSTHRU_MSG],
        timeout: u32,
    ) -> PassthruResult<usize> {
        log::debug!(
            "PT_WRITE_MSGS called, channel ID {channel_id}, {} msgs, timeout {timeout}",
            msgs.len()
        );
        if msgs.is_empty() {
            return Ok(0);
        }
        let mut msg_count: u32 = msgs.len() as u32;
        let res =
            unsafe { (self.write_msg_fn)(channel_id, msgs.as_mut_ptr(), &mut msg_count, timeout) };
        ret_res(res, msg_count as usize)
    }

    /// PassThruReadMsgs. BUFFER_EMPTY and TIMEOUT are not errors on read:
    /// whatever arrived before the deadline is returned.
    pub fn read_messages(
        &self,
        channel_id: u32,
        max_msgs: u32,
        timeout: u32,
    ) -> PassthruResult<Vec<PASSTHRU_MSG>> {
        let mut msg_count: u32 = max_msgs;
        let mut read_array: Vec<PASSTHRU_MSG> = vec![
            PASSTHRU_MSG {
                protocol_id: 0,
                rx_status: 0,
                tx_flags: 0,
                timestamp: 0,
                data_size: 0,
                extra_data_size: 0,
                data: [0; 4128]
            };
            max_msgs as usize
        ];

        let res =
            unsafe { (self.read_msg_fn)(channel_id, read_array.as_mut_ptr(), &mut msg_count, timeout) };
        if res == PassthruError::ERR_BUFFER_EMPTY as i32
            || res == PassthruError::ERR_TIMEOUT as i32
        {
            read_array.truncate(msg_count as usize);
            return Ok(read_array);
        }
        read_array.truncate(msg_count as usize);
        ret_res(res, read_array)
    }

    /// PassThruStartMsgFilter. Returns the filter ID
    pub fn start_msg_filter(
        &self,
        channel_id: u32,
        filter_type: FilterType,
        mask: &PASSTHRU_MSG,
        pattern: &PASSTHRU_MSG,
        flow_control: Option<PASSTHRU_MSG>,
    ) -> PassthruResult<u32> {
        log::debug!("PT_START_MSG_FILTER called, channel ID {channel_id}");
        if filter_type as u32 == FilterType::FLOW_CONTROL_FILTER as u32 && flow_control.is_none() {
            return Err(PassthruError::ERR_INVALID_FILTER_ID);
        }
        let mut filter_id: u32 = 0;
        let res = match flow_control.as_ref() {
            None => unsafe {
                (self.start_filter_fn)(
                    channel_id,
                    filter_type as u32,
                    mask,
                    pattern,
                    std::ptr::null(),
                    &mut filter_id,
                )
            },
            Some(fc) => unsafe {
                (self.start_filter_fn)(
                    channel_id,
                    filter_type as u32,
                    mask,
                    pattern,
                    fc,
                    &mut filter_id,
                )
            },
        };
        ret_res(res, filter_id)
    }

    /// PassThruStopMsgFilter
    pub fn stop_msg_filter(&self, channel_id: u32, filter_id: u32) -> PassthruResult<()> {
        log::debug!("PT_STOP_MSG_FILTER called, channel ID {channel_id}, filter ID {filter_id}");
        ret_res(unsafe { (self.stop_filter_fn)(channel_id, filter_id) }, ())
    }

    /// PassThruIoctl
    pub fn ioctl(
        &self,
        handle_id: u32,
        ioctl_id: IoctlID,
        input: *mut c_void,
        output: *mut c_void,
    ) -> PassthruResult<()> {
        log::debug!("PT_IOCTL called, handle ID {handle_id}, IOCTL {ioctl_id}");
        ret_res(
            unsafe { (self.ioctl_fn)(handle_id, ioctl_id as u32, input, output) },
            (),
        )
    }

    /// PassThruReadVersion
    pub fn read_version(&self, dev_id: u32) -> PassthruResult<DrvVersion> {
        log::debug!("PT_READ_VERSION called, device ID {dev_id}");
        let mut firmware_version: [u8; 80] = [0; 80];
        let mut dll_version: [u8; 80] = [0; 80];
        let mut api_version: [u8; 80] = [0; 80];
        let res = unsafe {
            (self.read_version_fn)(
                dev_id,
                firmware_version.as_mut_ptr().cast::<c_char>(),
                dll_version.as_mut_ptr().cast::<c_char>(),
                api_version.as_mut_ptr().cast::<c_char>(),
            )
        };
        ret_res(
            res,
            DrvVersion {
                dll_version: c_buf_to_string(&dll_version),
                api_version: c_buf_to_string(&api_version),
                fw_version: c_buf_to_string(&firmware_version),
            },
        )
    }

    /// PassThruGetLastError, queried after an ERR_FAILED status
    pub fn get_last_error(&self) -> PassthruResult<String> {
        let mut err: [u8; 80] = [0; 80];
        let res = unsafe { (self.get_last_err_fn)(err.as_mut_ptr().cast::<c_char>()) };
        ret_res(res, c_buf_to_string(&err))
    }
}
