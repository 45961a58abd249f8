//! 进程上下文，由调用方创建后传给本地节点

use std::env;

/// 远程启动节点时转发给子进程的环境变量
pub const FORWARDED_ENV: [&str; 2] = ["DYLD_LIBRARY_PATH", "RUST_LOG"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Context {
    /// 远程启动时执行的程序
    pub program_name: String,
    /// 需要转发的环境变量及其值
    pub forwarded_env: Vec<(String, String)>,
}

impl Context {
    pub fn new(program_name: &str) -> Self {
        Self {
            program_name: program_name.to_string(),
            forwarded_env: Vec::new(),
        }
    }

    /// 从当前进程的参数和环境变量构造
    pub fn from_env() -> Self {
        let program_name = env::current_exe()
            .ok()
            .and_then(|path| path.to_str().map(str::to_string))
            .or_else(|| env::args().next())
            .unwrap_or_default();
        let forwarded_env = FORWARDED_ENV
            .iter()
            .filter_map(|name| env::var(name).ok().map(|value| (name.to_string(), value)))
            .collect();
        Self {
            program_name,
            forwarded_env,
        }
    }

    pub fn with_env(mut self, name: &str, value: &str) -> Self {
        self.forwarded_env.push((name.to_string(), value.to_string()));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_env_has_program() {
        let ctx = Context::from_env();
        assert!(!ctx.program_name.is_empty());
        assert!(ctx
            .forwarded_env
            .iter()
            .all(|(name, _)| FORWARDED_ENV.contains(&name.as_str())));
    }
}
