fn main() {
    // Refuse to compile on non-64-bit platforms.
    if cfg!(not(target_pointer_width = "64")) {
        panic!("`rdma-echo` currently only supports 64-bit platforms");
    }
    println!("cargo:rerun-if-changed=build.rs");

    #[cfg(feature = "verbs")]
    verbs::main();
}

#[cfg(feature = "verbs")]
mod verbs {
    use std::env::{self, consts};
    use std::path::{Path, PathBuf};

    /// Include directories of the located `rdma-core` installation.
    struct RdmaCoreLink {
        include_dirs: Vec<String>,
    }

    /// Try to link to `libibverbs` and `librdmacm` registered to `pkg-config`.
    fn link_pkg_config() -> Result<RdmaCoreLink, ()> {
        let mut include_dirs = Vec::new();
        for lib in ["libibverbs", "librdmacm"] {
            let lib = pkg_config::Config::new()
                .statik(false)
                .probe(lib)
                .map_err(|_| ())?;
            include_dirs.extend(
                lib.include_paths
                    .iter()
                    .map(|p| p.to_str().unwrap().to_owned()),
            );
        }
        Ok(RdmaCoreLink { include_dirs })
    }

    /// Search for the libraries manually.
    ///
    /// Some distributions (and MLNX_OFED v4.x) do not register the libraries
    /// to `pkg-config`. We assume the default installation path as `/usr`
    /// unless `RDMA_CORE_LIB_DIR` says otherwise.
    fn link_manual() -> Result<RdmaCoreLink, ()> {
        let lib_dir = if let Ok(lib_dir) = env::var("RDMA_CORE_LIB_DIR") {
            PathBuf::from(lib_dir)
        } else {
            Path::new("/usr/lib").to_owned()
        };

        for lib in ["ibverbs", "rdmacm"] {
            let dylib_name = format!("{}{}{}", consts::DLL_PREFIX, lib, consts::DLL_SUFFIX);
            let static_name = format!("lib{}.a", lib);
            if !lib_dir.join(dylib_name).exists() && !lib_dir.join(static_name).exists() {
                return Err(());
            }
        }

        println!("cargo:rustc-link-search=native={}", lib_dir.display());
        println!("cargo:rustc-link-lib=ibverbs");
        println!("cargo:rustc-link-lib=rdmacm");
        let include_dirs = if let Ok(include_dir) = env::var("RDMA_CORE_INCLUDE_DIR") {
            vec![include_dir]
        } else {
            Vec::new()
        };
        Ok(RdmaCoreLink { include_dirs })
    }

    /// Build flow:
    ///
    /// 1. Try to link via `pkg-config`.
    /// 2. If failed, search the library directory manually.
    /// 3. Generate bindings for both `verbs.h` and `rdma_cma.h`.
    pub fn main() {
        println!("cargo:rerun-if-changed=src/bindings/rdma.h");
        println!("cargo:rerun-if-env-changed=RDMA_CORE_INCLUDE_DIR");
        println!("cargo:rerun-if-env-changed=RDMA_CORE_LIB_DIR");

        let link = link_pkg_config()
            .or_else(|_| link_manual())
            .expect("cannot find libibverbs and librdmacm");
        gen_bindings(link.include_dirs);
    }

    fn gen_bindings(include_dirs: Vec<String>) {
        let include_args = include_dirs.iter().map(|p| format!("-I{}", p));
        let bindings = bindgen::builder()
            .clang_args(include_args)
            .header("src/bindings/rdma.h")
            .allowlist_function("ibv_.*")
            .allowlist_function("rdma_.*")
            .allowlist_type("ibv_.*")
            .allowlist_type("rdma_.*")
            .opaque_type("pthread_.*")
            .blocklist_type("in6_addr")
            .blocklist_type("in_addr")
            .blocklist_type("sockaddr")
            .blocklist_type("sockaddr_in")
            .blocklist_type("sockaddr_in6")
            .blocklist_type("sockaddr_storage")
            .blocklist_type("timespec")
            .bitfield_enum("ibv_access_flags")
            .bitfield_enum("ibv_send_flags")
            .bitfield_enum("ibv_wc_flags")
            .constified_enum_module("ibv_wc_status")
            .constified_enum_module("ibv_wc_opcode")
            .constified_enum_module("ibv_wr_opcode")
            .constified_enum_module("ibv_qp_type")
            .constified_enum_module("ibv_qp_state")
            .constified_enum_module("rdma_cm_event_type")
            .constified_enum_module("rdma_port_space")
            .derive_copy(true)
            .derive_debug(false)
            .derive_default(true)
            .generate_comments(true)
            .layout_tests(false)
            .prepend_enum_name(false)
            .size_t_is_usize(true)
            .generate()
            .expect("failed to generate bindings");

        let out_dir = env::var_os("OUT_DIR").unwrap();
        let dest = Path::new(&out_dir).join("rdma_bindings.rs");
        bindings
            .write_to_file(dest)
            .expect("failed to write bindings");
    }
}
