//! Syscall numbers from `include/uapi/asm-generic/unistd.h`, as used by arm64.

pub(crate) const SYSCALLS: &[(&str, u32)] = &[
    ("getcwd", 17),
    ("dup", 23),
    ("dup3", 24),
    ("fcntl", 25),
    ("ioctl", 29),
    ("mkdirat", 34),
    ("unlinkat", 35),
    ("symlinkat", 36),
    ("linkat", 37),
    ("renameat", 38),
    ("faccessat", 48),
    ("chdir", 49),
    ("fchmodat", 53),
    ("openat", 56),
    ("close", 57),
    ("pipe2", 59),
    ("lseek", 62),
    ("read", 63),
    ("write", 64),
    ("pread64", 67),
    ("pwrite64", 68),
    ("ppoll", 73),
    ("readlinkat", 78),
    ("newfstatat", 79),
    ("fstat", 80),
    ("exit", 93),
    ("exit_group", 94),
    ("nanosleep", 101),
    ("clock_gettime", 113),
    ("kill", 129),
    ("uname", 160),
    ("getpid", 172),
    ("getppid", 173),
    ("getuid", 174),
    ("geteuid", 175),
    ("getgid", 176),
    ("gettid", 178),
    ("socket", 198),
    ("bind", 200),
    ("listen", 201),
    ("accept", 202),
    ("connect", 203),
    ("sendto", 206),
    ("recvfrom", 207),
    ("brk", 214),
    ("munmap", 215),
    ("clone", 220),
    ("execve", 221),
    ("mmap", 222),
    ("mprotect", 226),
    ("wait4", 260),
    ("renameat2", 276),
    ("getrandom", 278),
    ("memfd_create", 279),
    ("execveat", 281),
    ("statx", 291),
    ("pidfd_open", 434),
    ("clone3", 435),
    ("close_range", 436),
    ("openat2", 437),
    ("faccessat2", 439),
];
