//! Entry-point stubs in the instruction subset loaders execute.

/// `MOV AX, ax; RETF`
pub fn ret_ax(ax: u16) -> Vec<u8> {
    let [lo, hi] = ax.to_le_bytes();
    vec![0xB8, lo, hi, 0xCB]
}

/// `MOV AX, ax; MOV DX, dx; RETF`
pub fn ret_dx_ax(dx: u16, ax: u16) -> Vec<u8> {
    let [alo, ahi] = ax.to_le_bytes();
    let [dlo, dhi] = dx.to_le_bytes();
    vec![0xB8, alo, ahi, 0xBA, dlo, dhi, 0xCB]
}

/// `XOR AX, AX; CLC; RETF`
pub fn ok() -> Vec<u8> {
    vec![0x31, 0xC0, 0xF8, 0xCB]
}

/// `MOV AX, status; STC; RETF`
pub fn fail(status: u16) -> Vec<u8> {
    let [lo, hi] = status.to_le_bytes();
    vec![0xB8, lo, hi, 0xF9, 0xCB]
}
