// src/elm/mod.rs
//
// Line-oriented ELM327/OBD-II interpreter. Grounded on
// original_source/src/ELM327_Emulator.cpp (`loop`, `processELMCmd`,
// `processCANReply`); the line-buffer-plus-match-on-prefix/exact/length
// shape follows the teacher's `io/slcan/codec.rs` idiom for line-oriented
// ASCII protocols even though the wire format differs.

use crate::buffer::OutputBuffer;
use crate::can::CanFrame;

const LINE_BUF_CAPACITY: usize = 128;
const MONITOR_EXIT_THRESHOLD: u8 = 20;

#[derive(Debug, Clone)]
pub struct ElmState {
    pub ecu_address: u32,
    pub echo: bool,
    pub header: bool,
    pub linefeed: bool,
    pub monitor: bool,
    pub dlc: bool,
    line: String,
}

impl Default for ElmState {
    fn default() -> Self {
        ElmState {
            ecu_address: 0x7DF,
            echo: false,
            header: false,
            // Resolved from the §8 end-to-end examples (e.g. `atz` replying
            // "\r\nELM327 v1.3a\r\n>"), which require a CRLF line ending at
            // startup even though real ELM327 hardware defaults to ATL0.
            linefeed: true,
            monitor: false,
            dlc: false,
            line: String::new(),
        }
    }
}

#[derive(Default)]
pub struct ElmInterpreter {
    state: ElmState,
}

impl ElmInterpreter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &ElmState {
        &self.state
    }

    pub fn is_monitor(&self) -> bool {
        self.state.monitor
    }

    /// Feeds one inbound byte; returns a CAN frame to transmit when a PID
    /// request line completes.
    pub fn process_byte(&mut self, byte: u8, out: &mut OutputBuffer) -> Option<CanFrame> {
        if self.state.monitor {
            if byte > MONITOR_EXIT_THRESHOLD {
                self.state.monitor = false;
            }
            return None;
        }

        if byte == b'\r' {
            let line = std::mem::take(&mut self.state.line);
            return self.dispatch_line(&line, out);
        }

        let normalized = byte.to_ascii_lowercase();
        if normalized == b' ' || normalized == b'\n' {
            return None;
        }

        if self.state.line.len() < LINE_BUF_CAPACITY - 1 {
            self.state.line.push(normalized as char);
        }
        if self.state.line.len() >= LINE_BUF_CAPACITY - 1 {
            let line = std::mem::take(&mut self.state.line);
            return self.dispatch_line(&line, out);
        }
        None
    }

    fn dispatch_line(&mut self, line: &str, out: &mut OutputBuffer) -> Option<CanFrame> {
        // processELMCmd snapshots `bEcho`/`lineEnding` at the top, before the
        // command is interpreted, so a command that itself flips echo/linefeed
        // (ate0/1, atl0/1) renders under the *prior* value, not the new one.
        let echo = self.state.echo;
        let linefeed = self.state.linefeed;
        let (reply_text, frame) = if line.starts_with("at") {
            (self.dispatch_at(line), None)
        } else {
            self.parse_pid_request(line)
        };
        // Only `atz` concats an extra leading line-ending before its text
        // (ELM327_Emulator.cpp's processELMCmd: `retString.concat(lineEnding)`
        // appears solely in the atz branch); every other reply's text is
        // concatenated directly, with one trailing lineEnding + '>' shared
        // by all branches.
        let leading_ending = line == "atz";
        self.render(line, &reply_text, leading_ending, echo, linefeed, out);
        frame
    }

    fn dispatch_at(&mut self, line: &str) -> String {
        match line {
            "atz" => "ELM327 v1.3a".to_string(),
            "ati" => "ELM327 v1.5".to_string(),
            "at@1" => "OBDLink MX".to_string(),
            "atma" => {
                self.state.monitor = true;
                String::new()
            }
            "atd" => {
                self.reset_defaults();
                "OK".to_string()
            }
            "atrv" => "14.2V".to_string(),
            "atdp" => "can11/500".to_string(),
            "atdpn" => "6".to_string(),
            "ate0" => {
                self.state.echo = false;
                String::new()
            }
            "ate1" => {
                self.state.echo = true;
                String::new()
            }
            "ath0" => {
                self.state.header = false;
                "OK".to_string()
            }
            "ath1" => {
                self.state.header = true;
                "OK".to_string()
            }
            "atl0" => {
                self.state.linefeed = false;
                "OK".to_string()
            }
            "atl1" => {
                self.state.linefeed = true;
                "OK".to_string()
            }
            "atd0" => {
                self.state.dlc = false;
                "OK".to_string()
            }
            "atd1" => {
                self.state.dlc = true;
                "OK".to_string()
            }
            _ => {
                if let Some(hex) = line.strip_prefix("atsh") {
                    if let Ok(addr) = u32::from_str_radix(hex, 16) {
                        self.state.ecu_address = addr;
                    }
                }
                // atm* (other than atma), atat*, atsp*, and every other
                // at-command fall through to the generic "OK" reply.
                "OK".to_string()
            }
        }
    }

    fn reset_defaults(&mut self) {
        let addr = self.state.ecu_address;
        self.state = ElmState::default();
        self.state.ecu_address = addr;
    }

    fn parse_pid_request(&self, line: &str) -> (String, Option<CanFrame>) {
        let bytes = match hex::decode(line) {
            Ok(b) => b,
            Err(_) => return (String::new(), None),
        };
        let data = match bytes.as_slice() {
            [mode, pid] => [0x02, *mode, *pid, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA],
            [mode, pid_hi, pid_lo] => [0x03, *mode, *pid_hi, *pid_lo, 0xAA, 0xAA, 0xAA, 0xAA],
            // Other lengths: do not send, still emit line-ending + prompt.
            _ => return (String::new(), None),
        };
        (String::new(), Some(self.build_request_frame(data)))
    }

    fn build_request_frame(&self, data: [u8; 8]) -> CanFrame {
        // ELM327_Emulator.cpp hardcodes `outFrame.extended = false;`
        // unconditionally for every PID request, regardless of ecuAddress.
        CanFrame::new(self.state.ecu_address, false, 8, data)
    }

    fn render(
        &self,
        received_line: &str,
        reply_text: &str,
        leading_ending: bool,
        echo: bool,
        linefeed: bool,
        out: &mut OutputBuffer,
    ) {
        let ending = if linefeed { "\r\n" } else { "\r" };
        if echo {
            out.append_string(received_line);
            out.append_string(ending);
        }
        if leading_ending {
            out.append_string(ending);
        }
        if !reply_text.is_empty() {
            out.append_string(reply_text);
        }
        out.append_string(ending);
        out.append_string(">");
    }

    /// Renders a CAN reply frame handed in by CanDispatcher's fan-out rule
    /// (§4.4). No trailing prompt; monitor mode streams continuously.
    pub fn render_can_reply(&self, frame: &CanFrame, out: &mut OutputBuffer) {
        let mut s = String::new();
        if self.state.header || self.state.monitor {
            s.push_str(&format!("{:03X}", frame.id));
        }
        if self.state.dlc {
            s.push_str(&frame.length.to_string());
        }
        let iso_len = frame.data[0] as usize;
        let end = (1 + iso_len).min(frame.data.len());
        if end > 1 {
            let hex_bytes: Vec<String> = frame.data[1..end].iter().map(|b| format!("{:02X}", b)).collect();
            s.push_str(&hex_bytes.join(" "));
        }
        out.append_string(&s);
        let ending = if self.state.linefeed { "\r\n" } else { "\r" };
        out.append_string(ending);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_line(elm: &mut ElmInterpreter, line: &str, out: &mut OutputBuffer) -> Option<CanFrame> {
        let mut result = None;
        for b in line.bytes() {
            if let Some(f) = elm.process_byte(b, out) {
                result = Some(f);
            }
        }
        result
    }

    #[test]
    fn atz_with_defaults_matches_spec_example() {
        let mut elm = ElmInterpreter::new();
        let mut out = OutputBuffer::new();
        feed_line(&mut elm, "atz\r", &mut out);
        let text = String::from_utf8(out.take_all()).unwrap();
        assert_eq!(text, "\r\nELM327 v1.3a\r\n>");
    }

    #[test]
    fn pid_request_010c_builds_frame_and_empty_reply() {
        let mut elm = ElmInterpreter::new();
        let mut out = OutputBuffer::new();
        let frame = feed_line(&mut elm, "010c\r", &mut out).expect("frame emitted");
        assert_eq!(frame.id, 0x7DF);
        assert_eq!(frame.length, 8);
        assert_eq!(frame.payload(), &[0x02, 0x01, 0x0C, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA]);
        let text = String::from_utf8(out.take_all()).unwrap();
        assert_eq!(text, "\r\n>");
    }

    #[test]
    fn six_hex_pid_request_uses_two_byte_pid_shape() {
        let mut elm = ElmInterpreter::new();
        let mut out = OutputBuffer::new();
        let frame = feed_line(&mut elm, "01abcd\r", &mut out).expect("frame emitted");
        assert_eq!(frame.payload(), &[0x03, 0x01, 0xAB, 0xCD, 0xAA, 0xAA, 0xAA, 0xAA]);
    }

    #[test]
    fn captured_frame_rendering_with_header_enabled() {
        let mut elm = ElmInterpreter::new();
        let mut out = OutputBuffer::new();
        feed_line(&mut elm, "ath1\r", &mut out);
        let ath1_reply = String::from_utf8(out.take_all()).unwrap();
        assert_eq!(ath1_reply, "OK\r\n>");

        let mut data = [0u8; 8];
        data.copy_from_slice(&[0x04, 0x41, 0x0C, 0x1A, 0xF8, 0x00, 0x00, 0x00]);
        let frame = CanFrame::new(0x7E8, false, 8, data);
        elm.render_can_reply(&frame, &mut out);
        let text = String::from_utf8(out.take_all()).unwrap();
        assert_eq!(text, "7E841 0C 1A F8\r\n");
    }

    #[test]
    fn monitor_mode_exits_silently_on_non_control_byte() {
        let mut elm = ElmInterpreter::new();
        let mut out = OutputBuffer::new();
        feed_line(&mut elm, "atma\r", &mut out);
        out.take_all();
        assert!(elm.is_monitor());

        let produced = elm.process_byte(b'x', &mut out);
        assert!(produced.is_none());
        assert!(out.take_all().is_empty());
        assert!(!elm.is_monitor());
    }

    #[test]
    fn ate_and_atma_omit_text_but_still_emit_prompt() {
        let mut elm = ElmInterpreter::new();
        let mut out = OutputBuffer::new();
        feed_line(&mut elm, "ate1\r", &mut out);
        let text = String::from_utf8(out.take_all()).unwrap();
        assert_eq!(text, "\r\n>");
    }

    #[test]
    fn echo_emits_command_before_ending_not_after() {
        let mut elm = ElmInterpreter::new();
        let mut out = OutputBuffer::new();
        feed_line(&mut elm, "ate1\r", &mut out);
        out.take_all();
        feed_line(&mut elm, "ath1\r", &mut out);
        let text = String::from_utf8(out.take_all()).unwrap();
        assert_eq!(text, "ath1\r\nOK\r\n>");
    }

    #[test]
    fn pid_request_frame_is_never_extended_even_for_high_ecu_address() {
        let mut elm = ElmInterpreter::new();
        let mut out = OutputBuffer::new();
        feed_line(&mut elm, "atsh1fffffff\r", &mut out);
        out.take_all();
        let frame = feed_line(&mut elm, "010c\r", &mut out).expect("frame emitted");
        assert_eq!(frame.id, 0x1FFFFFFF);
        assert!(!frame.extended);
    }

    #[test]
    fn unrecognized_non_at_line_of_other_length_is_dropped_but_prompts() {
        let mut elm = ElmInterpreter::new();
        let mut out = OutputBuffer::new();
        let frame = feed_line(&mut elm, "0c\r", &mut out);
        assert!(frame.is_none());
        let text = String::from_utf8(out.take_all()).unwrap();
        assert_eq!(text, "\r\n>");
    }

    #[test]
    fn non_hex_garbage_of_valid_length_is_dropped_but_prompts() {
        let mut elm = ElmInterpreter::new();
        let mut out = OutputBuffer::new();
        let frame = feed_line(&mut elm, "01gz\r", &mut out);
        assert!(frame.is_none());
        let text = String::from_utf8(out.take_all()).unwrap();
        assert_eq!(text, "\r\n>");
    }
}
