// Copyright (c) 2025 the amivm project developers, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions.
// For more details, see the LICENSE, LICENSE.additional, and CONTRIBUTING files.

//! The built-in Exec library.
//!
//! Exec is the system library every AmigaOS program starts from: its
//! base pointer is the only absolute address in the system, and other
//! libraries are reached through its `OpenLibrary`. It lives inside the
//! supervisor (instead of being loaded from a shared object like the
//! other libraries) because `OpenLibrary` has to call back into the
//! library loader of this very process.
//!
//! Only `OpenLibrary` and `CloseLibrary` have native implementations;
//! every other entry synthesizes to the unimplemented-function trap.

use std::ffi::{c_char, CStr};
use std::sync::OnceLock;

use log::{debug, error};

use amivm_types::{FuncInfo, NativeFunc};

use crate::library::{host_library_path, load_library};

unsafe extern "C" fn exec_open_library(name: *const c_char, version: u32) -> u32 {
    let Ok(name) = CStr::from_ptr(name).to_str() else {
        error!("OpenLibrary: library name is not valid UTF-8");
        return 0;
    };
    debug!("OpenLibrary(\"{}\", {})", name, version);
    let path = host_library_path(name);
    match load_library(&path) {
        Ok(base) => base,
        Err(err) => {
            error!("could not open library '{}': {}", name, err);
            0
        }
    }
}

unsafe extern "C" fn exec_close_library(base: u32) {
    // the host library handle stays open; see library::OPEN_LIBRARIES
    debug!("CloseLibrary({:#010x})", base);
}

/// The Exec function table. Offsets, names and register descriptors
/// follow the V40 include files (`pragmas/exec_pragmas.h`).
pub fn function_table() -> &'static [FuncInfo] {
    static TABLE: OnceLock<Vec<FuncInfo>> = OnceLock::new();
    TABLE.get_or_init(|| {
        vec![
            FuncInfo::new(0x1e, "Supervisor", "D01"),
            FuncInfo::new(0x48, "InitCode", "1002"),
            FuncInfo::new(0x4e, "InitStruct", "0A903"),
            FuncInfo::new(0x54, "MakeLibrary", "10A9805"),
            FuncInfo::new(0x5a, "MakeFunctions", "A9803"),
            FuncInfo::new(0x60, "FindResident", "901"),
            FuncInfo::new(0x66, "InitResident", "1902"),
            FuncInfo::new(0x6c, "Alert", "701"),
            FuncInfo::new(0x72, "Debug", "001"),
            FuncInfo::new(0x78, "Disable", "00"),
            FuncInfo::new(0x7e, "Enable", "00"),
            FuncInfo::new(0x84, "Forbid", "00"),
            FuncInfo::new(0x8a, "Permit", "00"),
            FuncInfo::new(0x90, "SetSR", "1002"),
            FuncInfo::new(0x96, "SuperState", "00"),
            FuncInfo::new(0x9c, "UserState", "001"),
            FuncInfo::new(0xa2, "SetIntVector", "9002"),
            FuncInfo::new(0xa8, "AddIntServer", "9002"),
            FuncInfo::new(0xae, "RemIntServer", "9002"),
            FuncInfo::new(0xb4, "Cause", "901"),
            FuncInfo::new(0xba, "Allocate", "0802"),
            FuncInfo::new(0xc0, "Deallocate", "09803"),
            FuncInfo::new(0xc6, "AllocMem", "1002"),
            FuncInfo::new(0xcc, "AllocAbs", "9002"),
            FuncInfo::new(0xd2, "FreeMem", "0902"),
            FuncInfo::new(0xd8, "AvailMem", "101"),
            FuncInfo::new(0xde, "AllocEntry", "801"),
            FuncInfo::new(0xe4, "FreeEntry", "801"),
            FuncInfo::new(0xea, "Insert", "A9803"),
            FuncInfo::new(0xf0, "AddHead", "9802"),
            FuncInfo::new(0xf6, "AddTail", "9802"),
            FuncInfo::new(0xfc, "Remove", "901"),
            FuncInfo::new(0x102, "RemHead", "801"),
            FuncInfo::new(0x108, "RemTail", "801"),
            FuncInfo::new(0x10e, "Enqueue", "9802"),
            FuncInfo::new(0x114, "FindName", "9802"),
            FuncInfo::new(0x11a, "AddTask", "BA903"),
            FuncInfo::new(0x120, "RemTask", "901"),
            FuncInfo::new(0x126, "FindTask", "901"),
            FuncInfo::new(0x12c, "SetTaskPri", "0902"),
            FuncInfo::new(0x132, "SetSignal", "1002"),
            FuncInfo::new(0x138, "SetExcept", "1002"),
            FuncInfo::new(0x13e, "Wait", "001"),
            FuncInfo::new(0x144, "Signal", "0902"),
            FuncInfo::new(0x14a, "AllocSignal", "001"),
            FuncInfo::new(0x150, "FreeSignal", "001"),
            FuncInfo::new(0x156, "AllocTrap", "001"),
            FuncInfo::new(0x15c, "FreeTrap", "001"),
            FuncInfo::new(0x162, "AddPort", "901"),
            FuncInfo::new(0x168, "RemPort", "901"),
            FuncInfo::new(0x16e, "PutMsg", "9802"),
            FuncInfo::new(0x174, "GetMsg", "801"),
            FuncInfo::new(0x17a, "ReplyMsg", "901"),
            FuncInfo::new(0x180, "WaitPort", "801"),
            FuncInfo::new(0x186, "FindPort", "901"),
            FuncInfo::new(0x18c, "AddLibrary", "901"),
            FuncInfo::new(0x192, "RemLibrary", "901"),
            FuncInfo::new(0x198, "OldOpenLibrary", "901"),
            FuncInfo::implemented(
                0x19e,
                "CloseLibrary",
                "901",
                NativeFunc(exec_close_library as usize),
            ),
            FuncInfo::new(0x1a4, "SetFunction", "08903"),
            FuncInfo::new(0x1aa, "SumLibrary", "901"),
            FuncInfo::new(0x1b0, "AddDevice", "901"),
            FuncInfo::new(0x1b6, "RemDevice", "901"),
            FuncInfo::new(0x1bc, "OpenDevice", "190804"),
            FuncInfo::new(0x1c2, "CloseDevice", "901"),
            FuncInfo::new(0x1c8, "DoIO", "901"),
            FuncInfo::new(0x1ce, "SendIO", "901"),
            FuncInfo::new(0x1d4, "CheckIO", "901"),
            FuncInfo::new(0x1da, "WaitIO", "901"),
            FuncInfo::new(0x1e0, "AbortIO", "901"),
            FuncInfo::new(0x1e6, "AddResource", "901"),
            FuncInfo::new(0x1ec, "RemResource", "901"),
            FuncInfo::new(0x1f2, "OpenResource", "901"),
            FuncInfo::new(0x20a, "RawDoFmt", "BA9804"),
            FuncInfo::new(0x210, "GetCC", "00"),
            FuncInfo::new(0x216, "TypeOfMem", "901"),
            FuncInfo::new(0x21c, "Procure", "9802"),
            FuncInfo::new(0x222, "Vacate", "9802"),
            FuncInfo::implemented(
                0x228,
                "OpenLibrary",
                "0902",
                NativeFunc(exec_open_library as usize),
            ),
            FuncInfo::new(0x22e, "InitSemaphore", "801"),
            FuncInfo::new(0x234, "ObtainSemaphore", "801"),
            FuncInfo::new(0x23a, "ReleaseSemaphore", "801"),
            FuncInfo::new(0x240, "AttemptSemaphore", "801"),
            FuncInfo::new(0x246, "ObtainSemaphoreList", "801"),
            FuncInfo::new(0x24c, "ReleaseSemaphoreList", "801"),
            FuncInfo::new(0x252, "FindSemaphore", "901"),
            FuncInfo::new(0x258, "AddSemaphore", "901"),
            FuncInfo::new(0x25e, "RemSemaphore", "901"),
            FuncInfo::new(0x264, "SumKickData", "00"),
            FuncInfo::new(0x26a, "AddMemList", "9821005"),
            FuncInfo::new(0x270, "CopyMem", "09803"),
            FuncInfo::new(0x276, "CopyMemQuick", "09803"),
            FuncInfo::new(0x27c, "CacheClearU", "00"),
            FuncInfo::new(0x282, "CacheClearE", "10803"),
            FuncInfo::new(0x288, "CacheControl", "1002"),
            FuncInfo::new(0x28e, "CreateIORequest", "0802"),
            FuncInfo::new(0x294, "DeleteIORequest", "801"),
            FuncInfo::new(0x29a, "CreateMsgPort", "00"),
            FuncInfo::new(0x2a0, "DeleteMsgPort", "801"),
            FuncInfo::new(0x2a6, "ObtainSemaphoreShared", "801"),
            FuncInfo::new(0x2ac, "AllocVec", "1002"),
            FuncInfo::new(0x2b2, "FreeVec", "901"),
            FuncInfo::new(0x2b8, "CreatePool", "21003"),
            FuncInfo::new(0x2be, "DeletePool", "801"),
            FuncInfo::new(0x2c4, "AllocPooled", "0802"),
            FuncInfo::new(0x2ca, "FreePooled", "09803"),
            FuncInfo::new(0x2d0, "AttemptSemaphoreShared", "801"),
            FuncInfo::new(0x2d6, "ColdReboot", "00"),
            FuncInfo::new(0x2dc, "StackSwap", "801"),
            FuncInfo::new(0x2fa, "CachePreDMA", "09803"),
            FuncInfo::new(0x300, "CachePostDMA", "09803"),
            FuncInfo::new(0x306, "AddMemHandler", "901"),
            FuncInfo::new(0x30c, "RemMemHandler", "901"),
            FuncInfo::new(0x312, "ObtainQuickVector", "801"),
            FuncInfo::new(0x33c, "NewMinList", "801"),
            FuncInfo::new(0x354, "AVL_AddNode", "A9803"),
            FuncInfo::new(0x35a, "AVL_RemNodeByAddress", "9802"),
            FuncInfo::new(0x360, "AVL_RemNodeByKey", "A9803"),
            FuncInfo::new(0x366, "AVL_FindNode", "A9803"),
            FuncInfo::new(0x36c, "AVL_FindPrevNodeByAddress", "801"),
            FuncInfo::new(0x372, "AVL_FindPrevNodeByKey", "A9803"),
            FuncInfo::new(0x378, "AVL_FindNextNodeByAddress", "801"),
            FuncInfo::new(0x37e, "AVL_FindNextNodeByKey", "A9803"),
            FuncInfo::new(0x384, "AVL_FindFirstNode", "801"),
            FuncInfo::new(0x38a, "AVL_FindLastNode", "801"),
        ]
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::function_table;

    #[test]
    fn test_exec_table_shape() {
        let table = function_table();
        // no terminator row inside the slice
        assert!(table.iter().all(|row| row.offset != 0));

        let open = table.iter().find(|row| row.name == "OpenLibrary").unwrap();
        assert_eq!(open.offset, 0x228);
        assert_eq!(open.arg_regs, "0902");
        assert!(open.func.is_some());

        let close = table.iter().find(|row| row.name == "CloseLibrary").unwrap();
        assert!(close.func.is_some());

        // everything else traps
        let implemented = table.iter().filter(|row| row.func.is_some()).count();
        assert_eq!(implemented, 2);
    }
}
