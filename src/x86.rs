//! Syscall numbers from `arch/x86/entry/syscalls/syscall_64.tbl`.

pub(crate) const SYSCALLS: &[(&str, u32)] = &[
    ("read", 0),
    ("write", 1),
    ("open", 2),
    ("close", 3),
    ("stat", 4),
    ("fstat", 5),
    ("lstat", 6),
    ("poll", 7),
    ("lseek", 8),
    ("mmap", 9),
    ("mprotect", 10),
    ("munmap", 11),
    ("brk", 12),
    ("ioctl", 16),
    ("pread64", 17),
    ("pwrite64", 18),
    ("access", 21),
    ("pipe", 22),
    ("dup", 32),
    ("dup2", 33),
    ("nanosleep", 35),
    ("getpid", 39),
    ("socket", 41),
    ("connect", 42),
    ("accept", 43),
    ("sendto", 44),
    ("recvfrom", 45),
    ("bind", 49),
    ("listen", 50),
    ("clone", 56),
    ("fork", 57),
    ("vfork", 58),
    ("execve", 59),
    ("exit", 60),
    ("wait4", 61),
    ("kill", 62),
    ("uname", 63),
    ("fcntl", 72),
    ("getcwd", 79),
    ("chdir", 80),
    ("rename", 82),
    ("mkdir", 83),
    ("rmdir", 84),
    ("unlink", 87),
    ("readlink", 89),
    ("chmod", 90),
    ("getuid", 102),
    ("getgid", 104),
    ("geteuid", 107),
    ("getppid", 110),
    ("gettid", 186),
    ("clock_gettime", 228),
    ("exit_group", 231),
    ("openat", 257),
    ("mkdirat", 258),
    ("newfstatat", 262),
    ("unlinkat", 263),
    ("renameat", 264),
    ("linkat", 265),
    ("symlinkat", 266),
    ("readlinkat", 267),
    ("fchmodat", 268),
    ("faccessat", 269),
    ("ppoll", 271),
    ("dup3", 292),
    ("pipe2", 293),
    ("renameat2", 316),
    ("getrandom", 318),
    ("memfd_create", 319),
    ("execveat", 322),
    ("statx", 332),
    ("pidfd_open", 434),
    ("clone3", 435),
    ("close_range", 436),
    ("openat2", 437),
    ("faccessat2", 439),
];
