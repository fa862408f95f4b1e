use crate::address;

use color_eyre::eyre;
use std::path::Path;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("unknown command {0:?}")]
    UnknownCommand(String),

    #[error("malformed command {0:?}")]
    MalformedCommand(String),

    #[error("malformed kernel header line {0:?}")]
    MalformedHeader(String),

    #[error("malformed instruction record {0:?}")]
    MalformedInstruction(String),

    #[error("unknown opcode {0:?}")]
    UnknownOpcode(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Grid or block dimensions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Dim {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Dim {
    #[must_use]
    pub fn size(&self) -> u64 {
        u64::from(self.x) * u64::from(self.y) * u64::from(self.z)
    }
}

impl std::fmt::Display for Dim {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "({},{},{})", self.x, self.y, self.z)
    }
}

impl std::str::FromStr for Dim {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let err = || Error::MalformedHeader(value.to_string());
        let inner = value
            .trim()
            .strip_prefix('(')
            .and_then(|v| v.strip_suffix(')'))
            .ok_or_else(err)?;
        let mut parts = inner.split(',');
        let mut next = || -> Result<u32, Error> {
            parts
                .next()
                .ok_or_else(err)?
                .trim()
                .parse()
                .map_err(|_| err())
        };
        Ok(Self {
            x: next()?,
            y: next()?,
            z: next()?,
        })
    }
}

/// Kernel launch configuration from a trace header.
#[derive(Clone, Debug)]
pub struct KernelLaunch {
    pub id: u64,
    pub name: String,
    pub trace_file: String,
    pub grid: Dim,
    pub block: Dim,
    pub shared_mem_bytes: u32,
    pub num_registers: u32,
    pub stream_id: usize,
}

/// A trace-driven command.
#[derive(Clone, Debug)]
pub enum Command {
    MemcpyHtoD {
        dest_device_addr: address,
        num_bytes: u64,
    },
    KernelLaunch(KernelLaunch),
}

/// One per-warp instruction record.
#[derive(Clone, Debug)]
pub struct TraceInstruction {
    pub pc: usize,
    pub mask: u32,
    pub opcode: String,
    pub dest_regs: Vec<u32>,
    pub src_regs: Vec<u32>,
    pub mem_width: u32,
    pub base_addr: address,
    pub stride: i64,
}

#[derive(Clone, Debug)]
pub struct WarpTrace {
    pub warp_id: usize,
    pub instructions: Vec<TraceInstruction>,
}

#[derive(Clone, Debug)]
pub struct BlockTrace {
    pub block: Dim,
    pub warps: Vec<WarpTrace>,
}

fn parse_regs<'a>(
    tokens: &mut impl Iterator<Item = &'a str>,
    line: &str,
) -> Result<Vec<u32>, Error> {
    let err = || Error::MalformedInstruction(line.to_string());
    let count: usize = tokens.next().ok_or_else(err)?.parse().map_err(|_| err())?;
    (0..count)
        .map(|_| {
            let reg = tokens.next().ok_or_else(err)?;
            let reg = reg.strip_prefix('R').unwrap_or(reg);
            reg.parse::<u32>().map_err(|_| err())
        })
        .collect()
}

fn parse_addr(value: &str) -> Option<address> {
    if let Some(hex) = value.strip_prefix("0x") {
        address::from_str_radix(hex, 16).ok()
    } else {
        value.parse().ok()
    }
}

/// Parse the command list file.
///
/// Each line is either `MemcpyHtoD,<hex_addr>,<bytes>` or `kernel-<N>`.
/// Unknown command kinds are fatal.
pub fn parse_commands(path: impl AsRef<Path>) -> eyre::Result<Vec<Command>> {
    let traces_dir = path
        .as_ref()
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();
    let contents = std::fs::read_to_string(path.as_ref()).map_err(Error::Io)?;
    let mut commands = Vec::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("MemcpyHtoD,") {
            let err = || Error::MalformedCommand(line.to_string());
            let mut parts = rest.split(',');
            let dest_device_addr = parts
                .next()
                .and_then(|v| parse_addr(v.trim()))
                .ok_or_else(err)?;
            let num_bytes = parts
                .next()
                .and_then(|v| v.trim().parse().ok())
                .ok_or_else(err)?;
            commands.push(Command::MemcpyHtoD {
                dest_device_addr,
                num_bytes,
            });
        } else if line.starts_with("kernel-") {
            let trace_path = traces_dir.join(format!("{line}.traceg"));
            let (launch, _) = read_kernel_trace(&trace_path)?;
            commands.push(Command::KernelLaunch(launch));
        } else {
            return Err(Error::UnknownCommand(line.to_string()).into());
        }
    }
    Ok(commands)
}

/// Parse a `kernel-N.traceg` file: the launch header followed by per-warp
/// instruction records grouped into thread blocks.
pub fn read_kernel_trace(path: impl AsRef<Path>) -> eyre::Result<(KernelLaunch, Vec<BlockTrace>)> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path).map_err(Error::Io)?;
    let trace_file = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_default();

    let mut launch = KernelLaunch {
        id: 0,
        name: String::new(),
        trace_file,
        grid: Dim::default(),
        block: Dim::default(),
        shared_mem_bytes: 0,
        num_registers: 0,
        stream_id: 0,
    };

    let mut blocks: Vec<BlockTrace> = Vec::new();
    let mut current_warp: Option<WarpTrace> = None;

    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(header) = line.strip_prefix('-') {
            let err = || Error::MalformedHeader(line.to_string());
            let (key, value) = header.split_once('=').ok_or_else(err)?;
            let (key, value) = (key.trim(), value.trim());
            match key {
                "kernel name" => launch.name = value.to_string(),
                "kernel id" => launch.id = value.parse().map_err(|_| err())?,
                "grid dim" => launch.grid = value.parse()?,
                "block dim" => launch.block = value.parse()?,
                "shmem" => launch.shared_mem_bytes = value.parse().map_err(|_| err())?,
                "nregs" => launch.num_registers = value.parse().map_err(|_| err())?,
                "stream id" => launch.stream_id = value.parse().map_err(|_| err())?,
                _ => return Err(err().into()),
            }
            continue;
        }
        if let Some(block) = line.strip_prefix("block = ") {
            if let Some(warp) = current_warp.take() {
                blocks.last_mut().expect("block started").warps.push(warp);
            }
            blocks.push(BlockTrace {
                block: block.parse()?,
                warps: Vec::new(),
            });
            continue;
        }
        if let Some(warp_id) = line.strip_prefix("warp = ") {
            let err = || Error::MalformedHeader(line.to_string());
            if let Some(warp) = current_warp.take() {
                blocks.last_mut().ok_or_else(err)?.warps.push(warp);
            }
            current_warp = Some(WarpTrace {
                warp_id: warp_id.trim().parse().map_err(|_| err())?,
                instructions: Vec::new(),
            });
            continue;
        }

        // instruction record:
        // <pc> <mask> <ndst> [regs] <opcode> <nsrc> [regs] <width> [base stride]
        let err = || Error::MalformedInstruction(line.to_string());
        let warp = current_warp.as_mut().ok_or_else(err)?;
        let mut tokens = line.split_whitespace();
        let pc = usize::from_str_radix(tokens.next().ok_or_else(err)?, 16).map_err(|_| err())?;
        let mask = u32::from_str_radix(tokens.next().ok_or_else(err)?, 16).map_err(|_| err())?;

        let dest_regs = parse_regs(&mut tokens, line)?;
        let opcode = tokens.next().ok_or_else(err)?.to_string();
        if crate::opcodes::lookup(&opcode).is_none() {
            return Err(Error::UnknownOpcode(opcode).into());
        }
        let src_regs = parse_regs(&mut tokens, line)?;
        let mem_width: u32 = tokens.next().ok_or_else(err)?.parse().map_err(|_| err())?;
        let (base_addr, stride) = if mem_width > 0 {
            let base = tokens.next().and_then(parse_addr).ok_or_else(err)?;
            let stride = tokens
                .next()
                .and_then(|v| v.parse().ok())
                .ok_or_else(err)?;
            (base, stride)
        } else {
            (0, 0)
        };

        warp.instructions.push(TraceInstruction {
            pc,
            mask,
            opcode,
            dest_regs,
            src_regs,
            mem_width,
            base_addr,
            stride,
        });
    }
    if let Some(warp) = current_warp.take() {
        if let Some(block) = blocks.last_mut() {
            block.warps.push(warp);
        }
    }

    // warps are listed in warp id order within a block
    for block in &mut blocks {
        block.warps.sort_by_key(|warp| warp.warp_id);
    }
    Ok((launch, blocks))
}

#[cfg(test)]
mod tests {
    use color_eyre::eyre;
    use std::io::Write;

    fn write_temp(name: &str, contents: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("warpsim-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn parse_kernel_trace() -> eyre::Result<()> {
        let path = write_temp(
            "kernel-1.traceg",
            r"
-kernel name = vecadd
-kernel id = 1
-grid dim = (2,1,1)
-block dim = (32,1,1)
-shmem = 0
-nregs = 8
-stream id = 0

block = (0,0,0)
warp = 0
0000 ffffffff 1 R4 LDG 1 R2 4 0x80000000 4
0008 ffffffff 1 R6 FADD 2 R4 R5 0
0010 ffffffff 0 EXIT 0 0

block = (1,0,0)
warp = 0
0000 ffffffff 1 R4 LDG 1 R2 4 0x80001000 4
0010 ffffffff 0 EXIT 0 0
",
        );
        let (launch, blocks) = super::read_kernel_trace(&path)?;
        assert_eq!(launch.name, "vecadd");
        assert_eq!(launch.id, 1);
        assert_eq!(launch.grid.size(), 2);
        assert_eq!(launch.block.size(), 32);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].warps.len(), 1);
        assert_eq!(blocks[0].warps[0].instructions.len(), 3);

        let load = &blocks[0].warps[0].instructions[0];
        assert_eq!(load.opcode, "LDG");
        assert_eq!(load.dest_regs, vec![4]);
        assert_eq!(load.src_regs, vec![2]);
        assert_eq!(load.mem_width, 4);
        assert_eq!(load.base_addr, 0x8000_0000);
        assert_eq!(load.stride, 4);
        Ok(())
    }

    #[test]
    fn unknown_command_is_fatal() {
        let path = write_temp("commands-bad.trace", "launch-kernel-42\n");
        let result = super::parse_commands(&path);
        assert!(result.is_err());
    }

    #[test]
    fn unknown_opcode_is_fatal() {
        let path = write_temp(
            "kernel-9.traceg",
            r"
-kernel name = broken
-kernel id = 9
-grid dim = (1,1,1)
-block dim = (32,1,1)
-shmem = 0
-nregs = 8
-stream id = 0

block = (0,0,0)
warp = 0
0000 ffffffff 0 FROBNICATE 0 0
",
        );
        let result = super::read_kernel_trace(&path);
        assert!(result.is_err());
    }

    #[test]
    fn parse_memcpy_command() -> eyre::Result<()> {
        let path = write_temp("commands-memcpy.trace", "MemcpyHtoD,0x80000000,4096\n");
        let commands = super::parse_commands(&path)?;
        assert_eq!(commands.len(), 1);
        match &commands[0] {
            super::Command::MemcpyHtoD {
                dest_device_addr,
                num_bytes,
            } => {
                assert_eq!(*dest_device_addr, 0x8000_0000);
                assert_eq!(*num_bytes, 4096);
            }
            super::Command::KernelLaunch(_) => panic!("expected memcpy"),
        }
        Ok(())
    }
}
