use std::{
    fs,
    path::{Path, PathBuf},
    process::{Command, Output},
};

use ipt_rs::packet::{Packet, Writer};

pub const CODE_BASE: u64 = 0x1000;

// 0x1000 mov %rsp,%rbp; 0x1003 xor %eax,%eax; 0x1005 call 0x100a;
// 0x100a ret.
pub const CODE: [u8; 11] = [
    0x48, 0x89, 0xe5, 0x31, 0xc0, 0xe8, 0x00, 0x00, 0x00, 0x00, 0xc3,
];

pub fn encode(packets: &[Packet]) -> Vec<u8> {
    let mut writer = Writer::new(Vec::new());
    for packet in packets {
        writer.write(packet).expect("Failed to encode packet");
    }
    writer.into_inner()
}

/// Two PSB-delimited rounds over `CODE`: mov, xor, call, ret each.
pub fn two_rounds() -> Vec<Packet> {
    let mut packets = Vec::new();
    for _ in 0..2 {
        packets.push(Packet::Psb);
        packets.extend([0x1000, 0x1003, 0x1005, 0x100a].map(Packet::Ip));
    }
    packets
}

pub fn write_trace(dir: &Path, packets: &[Packet]) -> PathBuf {
    let path = dir.join("trace.flow");
    fs::write(&path, encode(packets)).expect("Failed to write trace");
    path
}

pub fn write_code(dir: &Path) -> PathBuf {
    let path = dir.join("code.bin");
    fs::write(&path, CODE).expect("Failed to write code");
    path
}

pub fn run(bin: &str, args: &[&str]) -> Output {
    Command::new(bin)
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .expect("Failed to run binary")
}

pub fn stdout_lines(output: &Output) -> Vec<String> {
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(String::from)
        .collect()
}

pub fn test_no_args(bin: &str) {
    let output = Command::new(bin).output().expect("Failed to run binary");

    assert!(
        !output.status.success(),
        "binary execution should have failed"
    );

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stdout.is_empty(), "stdout: {}", stdout);
    assert!(stderr.contains("Usage:"), "stderr: {}", stderr);
}
