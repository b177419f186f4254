// Copyright 2020 CoreOS, Inc.
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

use anyhow::{bail, Context, Result};
use std::io::{ErrorKind, Read, Write};
use std::process::{Command, Stdio};

/// Runs the provided command. The first macro argument is the executable, and following arguments
/// are passed to the command. Returns a Result<()> describing whether the command failed. Errors
/// are adequately prefixed with the full command.
#[macro_export]
macro_rules! runcmd {
    ($cmd:expr) => (runcmd!($cmd,));
    ($cmd:expr, $($args:expr),*) => {{
        let mut cmd = Command::new($cmd);
        $( cmd.arg($args); )*
        let status = cmd.status().with_context(|| format!("running {:#?}", cmd))?;
        if !status.success() {
            Result::Err(anyhow!("{:#?} failed with {}", cmd, status))
        } else {
            Result::Ok(())
        }
    }}
}

/// Runs the provided command, captures its stdout, and swallows its stderr except on failure.
/// The first macro argument is the executable, and following arguments are passed to the command.
/// Returns a Result<String> describing whether the command failed, and if not, its standard
/// output. Output is assumed to be UTF-8. Errors are adequately prefixed with the full command.
#[macro_export]
macro_rules! runcmd_output {
    ($cmd:expr) => (runcmd_output!($cmd,));
    ($cmd:expr, $($args:expr),*) => {{
        let mut cmd = Command::new($cmd);
        $( cmd.arg($args); )*
        // NB: cmd_output already prefixes with cmd in all error paths
        cmd_output(&mut cmd)
    }}
}

/// Runs the provided Command object, captures its stdout, and swallows its stderr except on
/// failure. Returns a Result<String> describing whether the command failed, and if not, its
/// standard output. Output is assumed to be UTF-8. Errors are adequately prefixed with the full
/// command.
pub fn cmd_output(cmd: &mut Command) -> Result<String> {
    let result = cmd
        .output()
        .with_context(|| format!("running {:#?}", cmd))?;
    if !result.status.success() {
        eprint!("{}", String::from_utf8_lossy(&result.stderr));
        bail!("{:#?} failed with {}", cmd, result.status);
    }
    String::from_utf8(result.stdout)
        .with_context(|| format!("decoding as UTF-8 output of `{:#?}`", cmd))
}

/// Runs the provided Command object with `input` written to its standard input, captures its
/// stdout, and swallows its stderr except on failure. Used for the handful of external tools
/// that take a password or key on stdin (`sudo -S`, `cryptsetup open --key-file -`).
pub fn cmd_output_with_stdin(cmd: &mut Command, input: &[u8]) -> Result<String> {
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawning {:#?}", cmd))?;
    child
        .stdin
        .take()
        .context("child has no stdin handle")?
        .write_all(input)
        .with_context(|| format!("writing stdin to {:#?}", cmd))?;
    let result = child
        .wait_with_output()
        .with_context(|| format!("running {:#?}", cmd))?;
    if !result.status.success() {
        eprint!("{}", String::from_utf8_lossy(&result.stderr));
        bail!("{:#?} failed with {}", cmd, result.status);
    }
    String::from_utf8(result.stdout)
        .with_context(|| format!("decoding as UTF-8 output of `{:#?}`", cmd))
}

// The default BufReader/BufWriter buffer size is 8 KiB, which isn't large enough to fully
// amortize system call overhead when splicing multi-megabyte regions into the image file.
pub const BUFFER_SIZE: usize = 256 * 1024;

/// Like `std::io::copy()` but limits the number of bytes copied.
pub fn copy_n(
    reader: &mut (impl Read + ?Sized),
    writer: &mut (impl Write + ?Sized),
    mut n: u64,
    buf: &mut [u8],
) -> Result<u64> {
    let mut written = 0;
    loop {
        if n == 0 {
            return Ok(written);
        }
        let bufn = if n < (buf.len() as u64) {
            &mut buf[..n as usize]
        } else {
            &mut *buf
        };
        let len = match reader.read(bufn) {
            Ok(0) => return Ok(written),
            Ok(len) => len,
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        assert!(len as u64 <= n);
        writer.write_all(&bufn[..len])?;
        written += len as u64;
        n -= len as u64;
    }
}

/// Like `copy_n()` but errors if fewer than `n` bytes were available.
pub fn copy_exactly_n(
    reader: &mut (impl Read + ?Sized),
    writer: &mut (impl Write + ?Sized),
    n: u64,
    buf: &mut [u8],
) -> Result<u64> {
    let copied = copy_n(reader, writer, n, buf)?;
    if copied != n {
        bail!("expected to copy {} bytes but instead copied {}", n, copied);
    }
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_n() {
        let mut sink = std::io::sink();
        let mut buf = [0u8; 16];
        let data = [0u8; 30];
        assert_eq!(copy_exactly_n(&mut &data[..], &mut sink, 30, &mut buf).unwrap(), 30);
        assert_eq!(copy_n(&mut &data[..], &mut sink, 40, &mut buf).unwrap(), 30);
        assert!(copy_exactly_n(&mut &data[..], &mut sink, 40, &mut buf).is_err());
    }
}
