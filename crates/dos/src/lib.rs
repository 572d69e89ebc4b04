// Copyright (c) 2025 the amivm project developers, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions.
// For more details, see the LICENSE, LICENSE.additional, and CONTRIBUTING files.

//! The native `dos.library`, built as `libdos.so`.
//!
//! Exports the library function table through the
//! [`FUNC_TABLE_SYMBOL`](amivm_types::FUNC_TABLE_SYMBOL) entry point
//! that the library loader resolves after `dlopen`. Offsets, names and
//! register descriptors follow the V40 include files
//! (`pragmas/dos_pragmas.h`); the duplicate offsets (`DoPkt` and its
//! arity variants, the tag-list aliases) are kept, with later rows
//! simply overwriting the same dispatch entry.
//!
//! `PutStr` is the one function with a native implementation.

use std::ffi::{c_char, CStr};
use std::io::Write;
use std::sync::OnceLock;

use amivm_types::{FuncInfo, NativeFunc};

/// PutStr(str/D1): writes the NUL-terminated string to standard
/// output. Returns 0 on success.
unsafe extern "C" fn dos_put_str(string: *const c_char) -> i32 {
    let bytes = CStr::from_ptr(string).to_bytes();
    let mut stdout = std::io::stdout();
    match stdout.write_all(bytes).and_then(|_| stdout.flush()) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

fn function_table() -> &'static [FuncInfo] {
    static TABLE: OnceLock<Vec<FuncInfo>> = OnceLock::new();
    TABLE.get_or_init(|| {
        vec![
            FuncInfo::new(0x1e, "Open", "2102"),
            FuncInfo::new(0x24, "Close", "101"),
            FuncInfo::new(0x2a, "Read", "32103"),
            FuncInfo::new(0x30, "Write", "32103"),
            FuncInfo::new(0x36, "Input", "00"),
            FuncInfo::new(0x3c, "Output", "00"),
            FuncInfo::new(0x42, "Seek", "32103"),
            FuncInfo::new(0x48, "DeleteFile", "101"),
            FuncInfo::new(0x4e, "Rename", "2102"),
            FuncInfo::new(0x54, "Lock", "2102"),
            FuncInfo::new(0x5a, "UnLock", "101"),
            FuncInfo::new(0x60, "DupLock", "101"),
            FuncInfo::new(0x66, "Examine", "2102"),
            FuncInfo::new(0x6c, "ExNext", "2102"),
            FuncInfo::new(0x72, "Info", "2102"),
            FuncInfo::new(0x78, "CreateDir", "101"),
            FuncInfo::new(0x7e, "CurrentDir", "101"),
            FuncInfo::new(0x84, "IoErr", "00"),
            FuncInfo::new(0x8a, "CreateProc", "432104"),
            FuncInfo::new(0x90, "Exit", "101"),
            FuncInfo::new(0x96, "LoadSeg", "101"),
            FuncInfo::new(0x9c, "UnLoadSeg", "101"),
            FuncInfo::new(0xae, "DeviceProc", "101"),
            FuncInfo::new(0xb4, "SetComment", "2102"),
            FuncInfo::new(0xba, "SetProtection", "2102"),
            FuncInfo::new(0xc0, "DateStamp", "101"),
            FuncInfo::new(0xc6, "Delay", "101"),
            FuncInfo::new(0xcc, "WaitForChar", "2102"),
            FuncInfo::new(0xd2, "ParentDir", "101"),
            FuncInfo::new(0xd8, "IsInteractive", "101"),
            FuncInfo::new(0xde, "Execute", "32103"),
            FuncInfo::new(0xe4, "AllocDosObject", "2102"),
            FuncInfo::new(0xe4, "AllocDosObjectTagList", "2102"),
            FuncInfo::new(0xea, "FreeDosObject", "2102"),
            FuncInfo::new(0xf0, "DoPkt", "765432107"),
            FuncInfo::new(0xf0, "DoPkt0", "2102"),
            FuncInfo::new(0xf0, "DoPkt1", "32103"),
            FuncInfo::new(0xf0, "DoPkt2", "432104"),
            FuncInfo::new(0xf0, "DoPkt3", "5432105"),
            FuncInfo::new(0xf0, "DoPkt4", "65432106"),
            FuncInfo::new(0xf6, "SendPkt", "32103"),
            FuncInfo::new(0xfc, "WaitPkt", "00"),
            FuncInfo::new(0x102, "ReplyPkt", "32103"),
            FuncInfo::new(0x108, "AbortPkt", "2102"),
            FuncInfo::new(0x10e, "LockRecord", "5432105"),
            FuncInfo::new(0x114, "LockRecords", "2102"),
            FuncInfo::new(0x11a, "UnLockRecord", "32103"),
            FuncInfo::new(0x120, "UnLockRecords", "101"),
            FuncInfo::new(0x126, "SelectInput", "101"),
            FuncInfo::new(0x12c, "SelectOutput", "101"),
            FuncInfo::new(0x132, "FGetC", "101"),
            FuncInfo::new(0x138, "FPutC", "2102"),
            FuncInfo::new(0x13e, "UnGetC", "2102"),
            FuncInfo::new(0x144, "FRead", "432104"),
            FuncInfo::new(0x14a, "FWrite", "432104"),
            FuncInfo::new(0x150, "FGets", "32103"),
            FuncInfo::new(0x156, "FPuts", "2102"),
            FuncInfo::new(0x15c, "VFWritef", "32103"),
            FuncInfo::new(0x162, "VFPrintf", "32103"),
            FuncInfo::new(0x168, "Flush", "101"),
            FuncInfo::new(0x16e, "SetVBuf", "432104"),
            FuncInfo::new(0x174, "DupLockFromFH", "101"),
            FuncInfo::new(0x17a, "OpenFromLock", "101"),
            FuncInfo::new(0x180, "ParentOfFH", "101"),
            FuncInfo::new(0x186, "ExamineFH", "2102"),
            FuncInfo::new(0x18c, "SetFileDate", "2102"),
            FuncInfo::new(0x192, "NameFromLock", "32103"),
            FuncInfo::new(0x198, "NameFromFH", "32103"),
            FuncInfo::new(0x19e, "SplitName", "5432105"),
            FuncInfo::new(0x1a4, "SameLock", "2102"),
            FuncInfo::new(0x1aa, "SetMode", "2102"),
            FuncInfo::new(0x1b0, "ExAll", "5432105"),
            FuncInfo::new(0x1b6, "ReadLink", "5432105"),
            FuncInfo::new(0x1bc, "MakeLink", "32103"),
            FuncInfo::new(0x1c2, "ChangeMode", "32103"),
            FuncInfo::new(0x1c8, "SetFileSize", "32103"),
            FuncInfo::new(0x1ce, "SetIoErr", "101"),
            FuncInfo::new(0x1d4, "Fault", "432104"),
            FuncInfo::new(0x1da, "PrintFault", "2102"),
            FuncInfo::new(0x1e0, "ErrorReport", "432104"),
            FuncInfo::new(0x1ec, "Cli", "00"),
            FuncInfo::new(0x1f2, "CreateNewProc", "101"),
            FuncInfo::new(0x1f2, "CreateNewProcTagList", "101"),
            FuncInfo::new(0x1f8, "RunCommand", "432104"),
            FuncInfo::new(0x1fe, "GetConsoleTask", "00"),
            FuncInfo::new(0x204, "SetConsoleTask", "101"),
            FuncInfo::new(0x20a, "GetFileSysTask", "00"),
            FuncInfo::new(0x210, "SetFileSysTask", "101"),
            FuncInfo::new(0x216, "GetArgStr", "00"),
            FuncInfo::new(0x21c, "SetArgStr", "101"),
            FuncInfo::new(0x222, "FindCliProc", "101"),
            FuncInfo::new(0x228, "MaxCli", "00"),
            FuncInfo::new(0x22e, "SetCurrentDirName", "101"),
            FuncInfo::new(0x234, "GetCurrentDirName", "2102"),
            FuncInfo::new(0x23a, "SetProgramName", "101"),
            FuncInfo::new(0x240, "GetProgramName", "2102"),
            FuncInfo::new(0x246, "SetPrompt", "101"),
            FuncInfo::new(0x24c, "GetPrompt", "2102"),
            FuncInfo::new(0x252, "SetProgramDir", "101"),
            FuncInfo::new(0x258, "GetProgramDir", "00"),
            FuncInfo::new(0x25e, "SystemTagList", "2102"),
            FuncInfo::new(0x25e, "System", "2102"),
            FuncInfo::new(0x264, "AssignLock", "2102"),
            FuncInfo::new(0x26a, "AssignLate", "2102"),
            FuncInfo::new(0x270, "AssignPath", "2102"),
            FuncInfo::new(0x276, "AssignAdd", "2102"),
            FuncInfo::new(0x27c, "RemAssignList", "2102"),
            FuncInfo::new(0x282, "GetDeviceProc", "2102"),
            FuncInfo::new(0x288, "FreeDeviceProc", "101"),
            FuncInfo::new(0x28e, "LockDosList", "101"),
            FuncInfo::new(0x294, "UnLockDosList", "101"),
            FuncInfo::new(0x29a, "AttemptLockDosList", "101"),
            FuncInfo::new(0x2a0, "RemDosEntry", "101"),
            FuncInfo::new(0x2a6, "AddDosEntry", "101"),
            FuncInfo::new(0x2ac, "FindDosEntry", "32103"),
            FuncInfo::new(0x2b2, "NextDosEntry", "2102"),
            FuncInfo::new(0x2b8, "MakeDosEntry", "2102"),
            FuncInfo::new(0x2be, "FreeDosEntry", "101"),
            FuncInfo::new(0x2c4, "IsFileSystem", "101"),
            FuncInfo::new(0x2ca, "Format", "32103"),
            FuncInfo::new(0x2d0, "Relabel", "2102"),
            FuncInfo::new(0x2d6, "Inhibit", "2102"),
            FuncInfo::new(0x2dc, "AddBuffers", "2102"),
            FuncInfo::new(0x2e2, "CompareDates", "2102"),
            FuncInfo::new(0x2e8, "DateToStr", "101"),
            FuncInfo::new(0x2ee, "StrToDate", "101"),
            FuncInfo::new(0x2f4, "InternalLoadSeg", "A98004"),
            FuncInfo::new(0x2fa, "InternalUnLoadSeg", "9102"),
            FuncInfo::new(0x300, "NewLoadSeg", "2102"),
            FuncInfo::new(0x300, "NewLoadSegTagList", "2102"),
            FuncInfo::new(0x306, "AddSegment", "32103"),
            FuncInfo::new(0x30c, "FindSegment", "32103"),
            FuncInfo::new(0x312, "RemSegment", "101"),
            FuncInfo::new(0x318, "CheckSignal", "101"),
            FuncInfo::new(0x31e, "ReadArgs", "32103"),
            FuncInfo::new(0x324, "FindArg", "2102"),
            FuncInfo::new(0x32a, "ReadItem", "32103"),
            FuncInfo::new(0x330, "StrToLong", "2102"),
            FuncInfo::new(0x336, "MatchFirst", "2102"),
            FuncInfo::new(0x33c, "MatchNext", "101"),
            FuncInfo::new(0x342, "MatchEnd", "101"),
            FuncInfo::new(0x348, "ParsePattern", "32103"),
            FuncInfo::new(0x34e, "MatchPattern", "2102"),
            FuncInfo::new(0x35a, "FreeArgs", "101"),
            FuncInfo::new(0x366, "FilePart", "101"),
            FuncInfo::new(0x36c, "PathPart", "101"),
            FuncInfo::new(0x372, "AddPart", "32103"),
            FuncInfo::new(0x378, "StartNotify", "101"),
            FuncInfo::new(0x37e, "EndNotify", "101"),
            FuncInfo::new(0x384, "SetVar", "432104"),
            FuncInfo::new(0x38a, "GetVar", "432104"),
            FuncInfo::new(0x390, "DeleteVar", "2102"),
            FuncInfo::new(0x396, "FindVar", "2102"),
            FuncInfo::new(0x3a2, "CliInitNewcli", "801"),
            FuncInfo::new(0x3a8, "CliInitRun", "801"),
            FuncInfo::new(0x3ae, "WriteChars", "2102"),
            FuncInfo::implemented(0x3b4, "PutStr", "101", NativeFunc(dos_put_str as usize)),
            FuncInfo::new(0x3ba, "VPrintf", "2102"),
            FuncInfo::new(0x3c6, "ParsePatternNoCase", "32103"),
            FuncInfo::new(0x3cc, "MatchPatternNoCase", "2102"),
            FuncInfo::new(0x3d8, "SameDevice", "2102"),
            FuncInfo::new(0x3de, "ExAllEnd", "5432105"),
            FuncInfo::new(0x3e4, "SetOwner", "2102"),
            FuncInfo::end(),
        ]
    })
}

/// The entry point the library loader resolves: returns the first row
/// of the null-terminated function table.
#[no_mangle]
pub extern "C" fn amiga_library_functions() -> *const FuncInfo {
    function_table().as_ptr()
}
