//! # Calling-convention encoder
//!
//! Builds the machine code a remote thread runs to call one function in the
//! target with arbitrary integer arguments, and decodes such stubs back.
//!
//! A remote thread starts in a `LPTHREAD_START_ROUTINE`, which takes exactly
//! one argument. The stub adapts that to the real callee's signature.
//!
//! ## x64 (Microsoft x64 ABI)
//!
//! ```text
//! 48 81 EC imm32        sub  rsp, frame          ; shadow space + stack args, keeps rsp 16-aligned at the call
//! 48 B8 imm64           mov  rax, argN           ; for each argument past the fourth
//! 48 89 84 24 disp32    mov  [rsp+0x20+8*i], rax
//! 48 B9 / 48 BA /       mov  rcx / rdx /
//! 49 B8 / 49 B9 imm64        r8 / r9, argN       ; first four arguments
//! 48 B8 imm64           mov  rax, function
//! FF D0                 call rax
//! 48 81 C4 imm32        add  rsp, frame
//! C3                    ret                      ; rax (exit code) = callee result
//! ```
//!
//! ## x86 (stdcall thread routine calling cdecl or stdcall)
//!
//! ```text
//! 55                    push ebp
//! 89 E5                 mov  ebp, esp
//! 68 imm32              push argN                ; right to left, 64-bit values as high then low dword
//! B8 imm32              mov  eax, function
//! FF D0                 call eax
//! 89 EC                 mov  esp, ebp            ; undoes the pushes whoever cleans up
//! 5D                    pop  ebp
//! C2 04 00              ret  4                   ; pops the thread parameter
//! ```

use smallvec::SmallVec;

use crate::error::{Result, TripwireError};
use crate::types::{Address, Bitness};

const X64_SHADOW_SPACE: u32 = 0x20;
const X64_REGISTER_MOVS: [[u8; 2]; 4] = [[0x48, 0xB9], [0x48, 0xBA], [0x49, 0xB8], [0x49, 0xB9]];

/// One argument of a remote call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallArg
{
    /// 32-bit integer (`int`, `BOOL`, `DWORD`)
    U32(u32),
    /// 64-bit integer; occupies two stack slots on x86
    U64(u64),
    /// Pointer into the target; must fit in 32 bits on x86
    Pointer(Address),
}

/// A stub decoded back into its call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedCall
{
    /// Function the stub calls
    pub function: Address,
    /// Argument slots in call order
    ///
    /// x64: one entry per argument. x86: one entry per stack dword, so a
    /// [`CallArg::U64`] shows up as low then high dword.
    pub args: SmallVec<[u64; 8]>,
}

/// Encodes calls for one target bitness
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallEncoder
{
    bitness: Bitness,
}

impl CallEncoder
{
    /// Encoder for `bitness`
    #[must_use]
    pub const fn new(bitness: Bitness) -> Self
    {
        Self { bitness }
    }

    /// Target bitness
    #[must_use]
    pub const fn bitness(&self) -> Bitness
    {
        self.bitness
    }

    /// Build a stub that calls `function` with `args`
    ///
    /// ## Errors
    ///
    /// - `InvalidArgument`: a pointer or the function address does not fit a
    ///   32-bit target, or the argument list is too large to frame
    pub fn encode(&self, function: Address, args: &[CallArg]) -> Result<Vec<u8>>
    {
        match self.bitness {
            Bitness::X64 => encode_x64(function, args),
            Bitness::X86 => encode_x86(function, args),
        }
    }

    /// Parse a stub produced by [`CallEncoder::encode`]
    ///
    /// ## Errors
    ///
    /// - `InvalidArgument`: the bytes are not a stub of this bitness
    pub fn decode(&self, code: &[u8]) -> Result<DecodedCall>
    {
        let mut reader = Reader { code, position: 0 };
        let call = match self.bitness {
            Bitness::X64 => decode_x64(&mut reader),
            Bitness::X86 => decode_x86(&mut reader),
        }?;
        if reader.position != code.len() {
            return Err(malformed(reader.position, "trailing bytes"));
        }
        Ok(call)
    }
}

fn arg_value(arg: CallArg) -> u64
{
    match arg {
        CallArg::U32(value) => u64::from(value),
        CallArg::U64(value) => value,
        CallArg::Pointer(address) => address.value(),
    }
}

fn x64_frame_size(args: &[CallArg]) -> Result<u32>
{
    let stack_args = u32::try_from(args.len().saturating_sub(X64_REGISTER_MOVS.len()))
        .map_err(|_| TripwireError::InvalidArgument("too many call arguments".to_string()))?;
    let frame = X64_SHADOW_SPACE + 8 * stack_args;
    // rsp is 8 mod 16 on entry (return address pushed), so the frame must be too.
    Ok(if frame % 16 == 8 { frame } else { frame + 8 })
}

#[allow(clippy::cast_possible_truncation)]
fn encode_x64(function: Address, args: &[CallArg]) -> Result<Vec<u8>>
{
    let frame = x64_frame_size(args)?;
    let mut code = Vec::with_capacity(32 + args.len() * 16);

    code.extend_from_slice(&[0x48, 0x81, 0xEC]);
    code.extend_from_slice(&frame.to_le_bytes());

    for (index, arg) in args.iter().enumerate().skip(X64_REGISTER_MOVS.len()) {
        let displacement = X64_SHADOW_SPACE + 8 * (index - X64_REGISTER_MOVS.len()) as u32;
        code.extend_from_slice(&[0x48, 0xB8]);
        code.extend_from_slice(&arg_value(*arg).to_le_bytes());
        code.extend_from_slice(&[0x48, 0x89, 0x84, 0x24]);
        code.extend_from_slice(&displacement.to_le_bytes());
    }

    for (opcode, arg) in X64_REGISTER_MOVS.iter().zip(args) {
        code.extend_from_slice(opcode);
        code.extend_from_slice(&arg_value(*arg).to_le_bytes());
    }

    code.extend_from_slice(&[0x48, 0xB8]);
    code.extend_from_slice(&function.value().to_le_bytes());
    code.extend_from_slice(&[0xFF, 0xD0]);
    code.extend_from_slice(&[0x48, 0x81, 0xC4]);
    code.extend_from_slice(&frame.to_le_bytes());
    code.push(0xC3);
    Ok(code)
}

fn narrow(value: Address, what: &str) -> Result<u32>
{
    value
        .to_u32()
        .ok_or_else(|| TripwireError::InvalidArgument(format!("{what} {value} does not fit a 32-bit target")))
}

#[allow(clippy::cast_possible_truncation)]
fn encode_x86(function: Address, args: &[CallArg]) -> Result<Vec<u8>>
{
    let mut code = Vec::with_capacity(16 + args.len() * 10);
    code.extend_from_slice(&[0x55, 0x89, 0xE5]);

    for arg in args.iter().rev() {
        let dwords: SmallVec<[u32; 2]> = match *arg {
            CallArg::U32(value) => smallvec::smallvec![value],
            CallArg::Pointer(address) => smallvec::smallvec![narrow(address, "pointer")?],
            CallArg::U64(value) => smallvec::smallvec![(value >> 32) as u32, value as u32],
        };
        for dword in dwords {
            code.push(0x68);
            code.extend_from_slice(&dword.to_le_bytes());
        }
    }

    code.push(0xB8);
    code.extend_from_slice(&narrow(function, "function")?.to_le_bytes());
    code.extend_from_slice(&[0xFF, 0xD0, 0x89, 0xEC, 0x5D, 0xC2, 0x04, 0x00]);
    Ok(code)
}

fn malformed(position: usize, what: &str) -> TripwireError
{
    TripwireError::InvalidArgument(format!("malformed call stub at byte {position}: {what}"))
}

struct Reader<'a>
{
    code: &'a [u8],
    position: usize,
}

impl Reader<'_>
{
    fn peek(&self, pattern: &[u8]) -> bool
    {
        self.code[self.position..].starts_with(pattern)
    }

    fn expect(&mut self, pattern: &[u8], what: &str) -> Result<()>
    {
        if self.peek(pattern) {
            self.position += pattern.len();
            Ok(())
        } else {
            Err(malformed(self.position, what))
        }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N]>
    {
        let bytes = self
            .code
            .get(self.position..self.position + N)
            .ok_or_else(|| malformed(self.position, "truncated immediate"))?;
        self.position += N;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32>
    {
        Ok(u32::from_le_bytes(self.take()?))
    }

    fn u64(&mut self) -> Result<u64>
    {
        Ok(u64::from_le_bytes(self.take()?))
    }
}

fn decode_x64(reader: &mut Reader<'_>) -> Result<DecodedCall>
{
    reader.expect(&[0x48, 0x81, 0xEC], "expected sub rsp")?;
    let frame = reader.u32()?;

    let mut stack_args: SmallVec<[(u32, u64); 4]> = SmallVec::new();
    let mut registers: SmallVec<[u64; 8]> = SmallVec::new();
    let function = loop {
        if reader.peek(&[0x48, 0xB8]) {
            reader.position += 2;
            let value = reader.u64()?;
            if reader.peek(&[0x48, 0x89, 0x84, 0x24]) && registers.is_empty() {
                reader.position += 4;
                stack_args.push((reader.u32()?, value));
                continue;
            }
            reader.expect(&[0xFF, 0xD0], "expected call rax")?;
            break Address::new(value);
        }
        let opcode = X64_REGISTER_MOVS
            .get(registers.len())
            .ok_or_else(|| malformed(reader.position, "expected function load"))?;
        reader.expect(opcode, "expected argument register load")?;
        registers.push(reader.u64()?);
    };

    if !stack_args.is_empty() && registers.len() != X64_REGISTER_MOVS.len() {
        return Err(malformed(reader.position, "stack arguments without all register arguments"));
    }
    reader.expect(&[0x48, 0x81, 0xC4], "expected add rsp")?;
    if reader.u32()? != frame {
        return Err(malformed(reader.position, "unbalanced stack frame"));
    }
    reader.expect(&[0xC3], "expected ret")?;

    stack_args.sort_by_key(|(displacement, _)| *displacement);
    let mut args = registers;
    args.extend(stack_args.into_iter().map(|(_, value)| value));
    Ok(DecodedCall { function, args })
}

fn decode_x86(reader: &mut Reader<'_>) -> Result<DecodedCall>
{
    reader.expect(&[0x55, 0x89, 0xE5], "expected frame setup")?;

    let mut pushed: SmallVec<[u64; 8]> = SmallVec::new();
    while reader.peek(&[0x68]) {
        reader.position += 1;
        pushed.push(u64::from(reader.u32()?));
    }

    reader.expect(&[0xB8], "expected mov eax")?;
    let function = Address::new(u64::from(reader.u32()?));
    reader.expect(&[0xFF, 0xD0, 0x89, 0xEC, 0x5D, 0xC2, 0x04, 0x00], "expected call and epilogue")?;

    pushed.reverse();
    Ok(DecodedCall { function, args: pushed })
}
