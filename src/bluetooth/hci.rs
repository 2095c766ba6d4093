// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! HCI status and disconnect reason codes.

pub const SUCCESS: u8 = 0x00;
pub const AUTHENTICATION_FAILURE: u8 = 0x05;
pub const CONNECTION_TIMEOUT: u8 = 0x08;
pub const REMOTE_USER_TERMINATED: u8 = 0x13;
pub const LOCAL_HOST_TERMINATED: u8 = 0x16;
pub const UNACCEPTABLE_CONN_PARAMS: u8 = 0x3B;
pub const CONN_FAILED_TO_BE_ESTABLISHED: u8 = 0x3E;

/// Human readable name of an HCI error code, for log lines.
pub fn error_name(code: u8) -> &'static str {
    match code {
        SUCCESS => "Success",
        0x01 => "Unknown HCI Command",
        0x02 => "Unknown Connection Identifier",
        0x03 => "Hardware Failure",
        0x04 => "Page Timeout",
        AUTHENTICATION_FAILURE => "Authentication Failure",
        0x06 => "PIN or Key Missing",
        0x07 => "Memory Capacity Exceeded",
        CONNECTION_TIMEOUT => "Connection Timeout",
        0x09 => "Connection Limit Exceeded",
        0x0C => "Command Disallowed",
        0x0D => "Connection Rejected due to Limited Resources",
        0x0E => "Connection Rejected Due To Security Reasons",
        0x11 => "Unsupported Feature or Parameter Value",
        0x12 => "Invalid HCI Command Parameters",
        REMOTE_USER_TERMINATED => "Remote User Terminated Connection",
        0x14 => "Remote Device Terminated Connection due to Low Resources",
        0x15 => "Remote Device Terminated Connection due to Power Off",
        LOCAL_HOST_TERMINATED => "Connection Terminated By Local Host",
        0x18 => "Pairing Not Allowed",
        0x1A => "Unsupported Remote Feature",
        0x1F => "Unspecified Error",
        0x22 => "LL Response Timeout",
        0x28 => "Instant Passed",
        UNACCEPTABLE_CONN_PARAMS => "Unacceptable Connection Parameters",
        0x3D => "Connection Terminated due to MIC Failure",
        CONN_FAILED_TO_BE_ESTABLISHED => "Connection Failed to be Established",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_reasons() {
        assert_eq!(
            error_name(REMOTE_USER_TERMINATED),
            "Remote User Terminated Connection"
        );
        assert_eq!(error_name(CONNECTION_TIMEOUT), "Connection Timeout");
        assert_eq!(error_name(0xEE), "Unknown");
    }
}
