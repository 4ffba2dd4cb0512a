// src/gvret/mod.rs
//
// Device-side GVRET protocol state machine. The teacher's `io/gvret/codec.rs`
// and `io/gvret/common.rs` parse frames sent BY a GVRET device (client
// direction); this codec is the mirror image, parsing commands sent TO one
// and emitting capture records, ground-truthed against
// original_source/src/gvret_comm.cpp (`GVRET_Comm_Handler::processIncomingByte`,
// `checksumCalc`).

use crate::buffer::OutputBuffer;
use crate::can::{CanFrame, NUM_BUSES};
use crate::settings::Settings;

const SYNC: u8 = 0xF1;
const ENTER_BINARY_MODE: u8 = 0xE7;

const CMD_BUILD_CAN_FRAME: u8 = 0x00;
const CMD_TIME_SYNC: u8 = 0x01;
const CMD_GET_DIG_INPUTS: u8 = 0x02;
const CMD_GET_ANALOG_INPUTS: u8 = 0x03;
const CMD_SET_DIG_OUT: u8 = 0x04;
const CMD_SETUP_CANBUS: u8 = 0x05;
const CMD_GET_CANBUS_PARAMS: u8 = 0x06;
const CMD_GET_DEV_INFO: u8 = 0x07;
const CMD_SET_SW_MODE: u8 = 0x08;
const CMD_KEEPALIVE: u8 = 0x09;
const CMD_SET_SYSTYPE: u8 = 0x0A;
const CMD_ECHO_CAN_FRAME: u8 = 0x0B;
const CMD_GET_NUMBUSES: u8 = 0x0C;
const CMD_GET_EXT_BUSES: u8 = 0x0D;
const CMD_SET_EXT_BUSES: u8 = 0x0E;

/// Build number reported by GET_DEV_INFO, carried over from the original
/// firmware's CFG_BUILD_NUM (original_source/src/config.h).
const CFG_BUILD_NUM: u16 = 618;

const FRAME_HEADER_LEN: usize = 6; // 4 id bytes + 1 bus byte + 1 length byte

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GvretState {
    Idle,
    GetCommand,
    BuildCanFrame,
    TimeSync,
    GetDigInputs,
    GetAnalogInputs,
    SetDigOutputs,
    SetupCanbus,
    SetSinglewireMode,
    SetSystype,
    EchoCanFrame,
    SetupExtBuses,
}

/// Side effect the dispatcher must carry out after a byte completes a
/// command. Commands with no external effect (replies written straight to
/// `out`, or ignored bodies) produce `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GvretEvent {
    SendFrame { bus: usize, frame: CanFrame },
    CaptureFrame { bus: usize, frame: CanFrame },
}

pub struct GvretCodec {
    state: GvretState,
    step: usize,
    scratch_id: u32,
    scratch_bus: u8,
    scratch_length: u8,
    scratch_data: [u8; 8],
    setup_canbus_words: [u32; 2],
}

impl Default for GvretCodec {
    fn default() -> Self {
        GvretCodec {
            state: GvretState::Idle,
            step: 0,
            scratch_id: 0,
            scratch_bus: 0,
            scratch_length: 0,
            scratch_data: [0u8; 8],
            setup_canbus_words: [0u32; 2],
        }
    }
}

impl GvretCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> GvretState {
        self.state
    }

    /// Feeds a single inbound byte. Writes any reply bytes into `out`;
    /// returns a `GvretEvent` when the byte completes a frame command.
    pub fn process_byte(
        &mut self,
        byte: u8,
        out: &mut OutputBuffer,
        settings: &mut Settings,
        now_us: u32,
    ) -> Option<GvretEvent> {
        match self.state {
            GvretState::Idle => {
                if byte == SYNC {
                    self.state = GvretState::GetCommand;
                } else if byte == ENTER_BINARY_MODE {
                    settings.use_binary_serial_comm = true;
                }
                None
            }
            GvretState::GetCommand => self.dispatch_command(byte, out, settings, now_us),
            GvretState::BuildCanFrame => self.step_build_frame(byte, false),
            GvretState::EchoCanFrame => self.step_build_frame(byte, true),
            GvretState::SetupCanbus => self.step_setup_canbus(byte, settings),
            GvretState::SetSystype => {
                settings.system_type = crate::settings::SystemType::from_u8(byte);
                self.state = GvretState::Idle;
                None
            }
            GvretState::SetDigOutputs | GvretState::SetSinglewireMode => {
                // single ignored body byte
                self.state = GvretState::Idle;
                None
            }
            GvretState::SetupExtBuses => {
                self.step += 1;
                if self.step >= 12 {
                    self.state = GvretState::Idle;
                    self.step = 0;
                }
                None
            }
            // Absorbing sink states: any byte besides a fresh 0xF1 is
            // discarded without re-entering GET_COMMAND via IDLE's 0xE7
            // branch.
            GvretState::TimeSync | GvretState::GetDigInputs | GvretState::GetAnalogInputs => {
                if byte == SYNC {
                    self.state = GvretState::GetCommand;
                }
                None
            }
        }
    }

    fn dispatch_command(
        &mut self,
        cmd: u8,
        out: &mut OutputBuffer,
        settings: &Settings,
        now_us: u32,
    ) -> Option<GvretEvent> {
        match cmd {
            CMD_BUILD_CAN_FRAME => {
                self.begin_frame_body();
                self.state = GvretState::BuildCanFrame;
            }
            CMD_ECHO_CAN_FRAME => {
                self.begin_frame_body();
                self.state = GvretState::EchoCanFrame;
            }
            CMD_TIME_SYNC => {
                let mut reply = vec![SYNC, CMD_TIME_SYNC];
                reply.extend_from_slice(&now_us.to_le_bytes());
                out.append_bytes(&reply);
                self.state = GvretState::TimeSync;
            }
            CMD_GET_DIG_INPUTS => {
                let reply = [SYNC, CMD_GET_DIG_INPUTS, 0x00];
                let checksum = checksum_calc(&reply);
                out.append_bytes(&reply);
                out.append_byte(checksum);
                self.state = GvretState::GetDigInputs;
            }
            CMD_GET_ANALOG_INPUTS => {
                let mut reply = vec![SYNC, CMD_GET_ANALOG_INPUTS];
                reply.extend_from_slice(&[0u8; 14]); // seven u16 LE zeros
                let checksum = checksum_calc(&reply);
                out.append_bytes(&reply);
                out.append_byte(checksum);
                self.state = GvretState::GetAnalogInputs;
            }
            CMD_SET_DIG_OUT => {
                self.state = GvretState::SetDigOutputs;
            }
            CMD_SETUP_CANBUS => {
                self.step = 0;
                self.setup_canbus_words = [0u32; 2];
                self.state = GvretState::SetupCanbus;
            }
            CMD_GET_CANBUS_PARAMS => {
                let mut reply = vec![SYNC, CMD_GET_CANBUS_PARAMS];
                // Hardcodes two buses regardless of NUM_BUSES; preserved
                // verbatim as a legacy client-compatibility quirk.
                for bus in &settings.buses[0..2] {
                    reply.push((bus.enabled as u8) | ((bus.listen_only as u8) << 4));
                    reply.extend_from_slice(&bus.nom_speed.to_le_bytes());
                }
                out.append_bytes(&reply);
                self.state = GvretState::Idle;
            }
            CMD_GET_DEV_INFO => {
                let build = CFG_BUILD_NUM.to_le_bytes();
                let reply = [SYNC, CMD_GET_DEV_INFO, build[0], build[1], 0x20, 0, 0, 0];
                out.append_bytes(&reply);
                self.state = GvretState::Idle;
            }
            CMD_SET_SW_MODE => {
                self.state = GvretState::SetSinglewireMode;
            }
            CMD_KEEPALIVE => {
                out.append_bytes(&[SYNC, CMD_KEEPALIVE, 0xDE, 0xAD]);
                self.state = GvretState::Idle;
            }
            CMD_SET_SYSTYPE => {
                self.state = GvretState::SetSystype;
            }
            CMD_GET_NUMBUSES => {
                out.append_bytes(&[SYNC, CMD_GET_NUMBUSES, NUM_BUSES as u8]);
                self.state = GvretState::Idle;
            }
            CMD_GET_EXT_BUSES => {
                let mut reply = vec![SYNC, CMD_GET_EXT_BUSES];
                reply.extend_from_slice(&[0u8; 15]);
                out.append_bytes(&reply);
                self.state = GvretState::Idle;
            }
            CMD_SET_EXT_BUSES => {
                self.step = 0;
                self.state = GvretState::SetupExtBuses;
            }
            _ => {
                // Unknown opcode: framing desync tolerance, go back to IDLE.
                self.state = GvretState::Idle;
            }
        }
        None
    }

    fn begin_frame_body(&mut self) {
        self.step = 0;
        self.scratch_id = 0;
        self.scratch_bus = 0;
        self.scratch_length = 0;
        self.scratch_data = [0u8; 8];
    }

    /// Shared byte-stepper for BUILD_CAN_FRAME and ECHO_CAN_FRAME: 4 id
    /// bytes LE, 1 bus byte, 1 length byte, then `len` data bytes. Bus and
    /// length are two independent single-purpose bytes on the wire
    /// (original_source/src/gvret_comm.cpp: `case 4: out_bus = in_byte & 3;`,
    /// `case 5: build_out_frame.length = in_byte & 0xF;`) — not a packed
    /// `length | (bus<<4)` byte, which is only how §4.1's *outbound* capture
    /// record encodes the pair.
    fn step_build_frame(&mut self, byte: u8, is_echo: bool) -> Option<GvretEvent> {
        if self.step < 4 {
            self.scratch_id |= (byte as u32) << (8 * self.step);
            self.step += 1;
            return None;
        }
        if self.step == 4 {
            self.scratch_bus = byte & 0x03;
            self.step += 1;
            return None;
        }
        if self.step == 5 {
            self.scratch_length = (byte & 0x0F).min(8);
            self.step += 1;
            if self.scratch_length == 0 {
                return self.finish_frame(is_echo);
            }
            return None;
        }
        let data_index = self.step - FRAME_HEADER_LEN;
        let length = self.scratch_length as usize;
        if data_index < length {
            self.scratch_data[data_index] = byte;
        }
        self.step += 1;
        if self.step - FRAME_HEADER_LEN >= length {
            return self.finish_frame(is_echo);
        }
        None
    }

    fn finish_frame(&mut self, is_echo: bool) -> Option<GvretEvent> {
        self.state = GvretState::Idle;
        let extended = self.scratch_id & (1 << 31) != 0;
        let id = self.scratch_id & 0x1FFF_FFFF;
        let bus = self.scratch_bus as usize;
        let frame = CanFrame::new(id, extended, self.scratch_length, self.scratch_data);
        if is_echo {
            Some(GvretEvent::CaptureFrame { bus, frame })
        } else if bus < NUM_BUSES {
            Some(GvretEvent::SendFrame { bus, frame })
        } else {
            None
        }
    }

    fn step_setup_canbus(&mut self, byte: u8, settings: &mut Settings) -> Option<GvretEvent> {
        let word_idx = self.step / 4;
        let byte_idx = self.step % 4;
        self.setup_canbus_words[word_idx] |= (byte as u32) << (8 * byte_idx);
        self.step += 1;
        if self.step >= 8 {
            for (bus_idx, word) in self.setup_canbus_words.iter().enumerate() {
                apply_setup_canbus_word(&mut settings.buses[bus_idx], *word);
            }
            self.state = GvretState::Idle;
            self.step = 0;
        }
        None
    }
}

/// Per-bus SETUP_CANBUS word decoding, preserved verbatim including the
/// 20-bit mask-then-clamp overflow behavior (spec.md Open Questions).
fn apply_setup_canbus_word(bus: &mut crate::can::BusConfig, word: u32) {
    if word == 0 {
        bus.enabled = false;
        return;
    }
    let nom_speed = (word & 0xFFFFF).min(1_000_000);
    bus.nom_speed = nom_speed;
    if word & 0x8000_0000 != 0 {
        bus.enabled = word & 0x4000_0000 != 0;
        bus.listen_only = word & 0x2000_0000 != 0;
    } else {
        bus.enabled = true;
    }
}

fn checksum_calc(buf: &[u8]) -> u8 {
    buf.iter().fold(0u8, |acc, b| acc ^ b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::can::BusConfig;

    fn feed(codec: &mut GvretCodec, bytes: &[u8], out: &mut OutputBuffer, settings: &mut Settings) -> Vec<GvretEvent> {
        bytes
            .iter()
            .filter_map(|&b| codec.process_byte(b, out, settings, 0))
            .collect()
    }

    #[test]
    fn keepalive_round_trip() {
        let mut codec = GvretCodec::new();
        let mut out = OutputBuffer::new();
        let mut settings = Settings::default();
        feed(&mut codec, &[0xF1, 0x09], &mut out, &mut settings);
        assert_eq!(out.take_all(), vec![0xF1, 0x09, 0xDE, 0xAD]);
        assert_eq!(codec.state(), GvretState::Idle);
    }

    #[test]
    fn get_numbuses_reports_five() {
        let mut codec = GvretCodec::new();
        let mut out = OutputBuffer::new();
        let mut settings = Settings::default();
        feed(&mut codec, &[0xF1, 0x0C], &mut out, &mut settings);
        assert_eq!(out.take_all(), vec![0xF1, 0x0C, 0x05]);
    }

    #[test]
    fn build_can_frame_end_to_end() {
        let mut codec = GvretCodec::new();
        let mut out = OutputBuffer::new();
        let mut settings = Settings::default();
        let bytes = [
            0xF1, 0x00, 0x23, 0x01, 0x00, 0x00, 0x00, 0x08, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66,
            0x77, 0x88,
        ];
        let events = feed(&mut codec, &bytes, &mut out, &mut settings);
        assert_eq!(events.len(), 1);
        match &events[0] {
            GvretEvent::SendFrame { bus, frame } => {
                assert_eq!(*bus, 0);
                assert_eq!(frame.id, 0x123);
                assert!(!frame.extended);
                assert_eq!(frame.length, 8);
                assert_eq!(frame.payload(), &[0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88]);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(codec.state(), GvretState::Idle);
    }

    #[test]
    fn build_can_frame_targets_nonzero_bus() {
        let mut codec = GvretCodec::new();
        let mut out = OutputBuffer::new();
        let mut settings = Settings::default();
        let bytes = [
            0xF1, 0x00, 0x23, 0x01, 0x00, 0x00, 0x01, 0x02, 0xAA, 0xBB,
        ];
        let events = feed(&mut codec, &bytes, &mut out, &mut settings);
        assert_eq!(events.len(), 1);
        match &events[0] {
            GvretEvent::SendFrame { bus, frame } => {
                assert_eq!(*bus, 1);
                assert_eq!(frame.length, 2);
                assert_eq!(frame.payload(), &[0xAA, 0xBB]);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn setup_canbus_enables_bus_zero_disables_bus_one() {
        let mut codec = GvretCodec::new();
        let mut out = OutputBuffer::new();
        let mut settings = Settings::default();
        let bytes = [0xF1, 0x05, 0xE8, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
        feed(&mut codec, &bytes, &mut out, &mut settings);
        assert!(settings.buses[0].enabled);
        assert!(!settings.buses[0].listen_only);
        assert_eq!(settings.buses[0].nom_speed, 1000);
        assert!(!settings.buses[1].enabled);
    }

    #[test]
    fn echo_can_frame_writes_capture_not_send() {
        let mut codec = GvretCodec::new();
        let mut out = OutputBuffer::new();
        let mut settings = Settings::default();
        let bytes = [
            0xF1, 0x0B, 0x23, 0x01, 0x00, 0x00, 0x00, 0x02, 0xAA, 0xBB,
        ];
        let events = feed(&mut codec, &bytes, &mut out, &mut settings);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], GvretEvent::CaptureFrame { bus: 0, .. }));
    }

    #[test]
    fn unknown_command_returns_to_idle_and_resyncs_on_next_f1() {
        let mut codec = GvretCodec::new();
        let mut out = OutputBuffer::new();
        let mut settings = Settings::default();
        feed(&mut codec, &[0xF1, 0xFF, 0x99, 0x99], &mut out, &mut settings);
        assert_eq!(codec.state(), GvretState::Idle);
        let events = feed(&mut codec, &[0xF1, 0x09], &mut out, &mut settings);
        assert!(events.is_empty());
        assert_eq!(out.take_all(), vec![0xF1, 0x09, 0xDE, 0xAD]);
    }

    #[test]
    fn state_never_sticks_invariant() {
        let mut codec = GvretCodec::new();
        let mut out = OutputBuffer::new();
        let mut settings = Settings::default();
        // Feed a long run of noise bytes, then confirm a fresh command
        // still dispatches correctly.
        let noise = [0u8; 50];
        feed(&mut codec, &noise, &mut out, &mut settings);
        out.take_all();
        let events = feed(&mut codec, &[0xF1, 0x0C], &mut out, &mut settings);
        assert!(events.is_empty());
        assert_eq!(out.take_all(), vec![0xF1, 0x0C, 0x05]);
    }

    #[test]
    fn get_canbus_params_hardcodes_two_buses() {
        let mut codec = GvretCodec::new();
        let mut out = OutputBuffer::new();
        let mut settings = Settings::default();
        settings.buses[0] = BusConfig { enabled: true, listen_only: false, nom_speed: 500_000, ..BusConfig::default() };
        feed(&mut codec, &[0xF1, 0x06], &mut out, &mut settings);
        let reply = out.take_all();
        assert_eq!(reply[0], 0xF1);
        assert_eq!(reply[1], 0x06);
        assert_eq!(reply.len(), 2 + 2 * 5);
    }
}
