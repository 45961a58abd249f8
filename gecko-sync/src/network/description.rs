use std::{fmt, str::FromStr, time::Duration};

use super::Error;

/// 未指定端口时使用的默认端口
pub const DEFAULT_PORT: u16 = 4242;

/// 连接使用的传输方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// tcp 套接字
    Tcp,
    /// 进程内的匿名管道
    Pipe,
    /// 子进程的标准输入输出
    Process,
}

/// 连接描述：传输方式，地址和启动命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDescription {
    pub protocol: Protocol,
    pub hostname: String,
    pub port: u16,
    /// 远程启动节点的命令模板，`%h` 替换为主机名，`%c` 替换为远程命令
    ///
    /// 远程命令整体放在单引号里，模板需要经过重新分词的 shell，
    /// 例如 `ssh -n %h %c`。对 Process 连接而言是交给 `sh -c` 执行的命令
    pub launch_command: Option<String>,
    pub launch_timeout: Duration,
}

impl ConnectionDescription {
    pub fn tcp(hostname: &str, port: u16) -> Self {
        Self {
            protocol: Protocol::Tcp,
            hostname: hostname.to_string(),
            port,
            launch_command: None,
            launch_timeout: Duration::from_secs(10),
        }
    }

    pub fn pipe() -> Self {
        Self {
            protocol: Protocol::Pipe,
            hostname: String::new(),
            port: 0,
            launch_command: None,
            launch_timeout: Duration::from_secs(10),
        }
    }

    pub fn process(command: &str) -> Self {
        Self {
            protocol: Protocol::Process,
            hostname: String::new(),
            port: 0,
            launch_command: Some(command.to_string()),
            launch_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_launch_command(mut self, command: &str) -> Self {
        self.launch_command = Some(command.to_string());
        self
    }

    pub fn with_launch_timeout(mut self, timeout: Duration) -> Self {
        self.launch_timeout = timeout;
        self
    }

    /// tcp 连接的 socket 地址
    pub fn address(&self) -> String {
        let host = if self.hostname.is_empty() {
            "0.0.0.0"
        } else {
            &self.hostname
        };
        format!("{}:{}", host, self.port)
    }
}

/// 解析 `<host-or-ip>[:<port>]`
impl FromStr for ConnectionDescription {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::InvalidAddress(s.to_string()));
        }
        let (host, port) = match s.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| Error::InvalidAddress(s.to_string()))?;
                (host, port)
            }
            None => (s, DEFAULT_PORT),
        };
        Ok(Self::tcp(host, port))
    }
}

impl fmt::Display for ConnectionDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.protocol {
            Protocol::Tcp => write!(f, "{}:{}", self.hostname, self.port),
            Protocol::Pipe => write!(f, "pipe"),
            Protocol::Process => write!(
                f,
                "process '{}'",
                self.launch_command.as_deref().unwrap_or_default()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_with_port() {
        let desc = "render1:5000".parse::<ConnectionDescription>().unwrap();
        assert_eq!(desc.protocol, Protocol::Tcp);
        assert_eq!(desc.hostname, "render1");
        assert_eq!(desc.port, 5000);
        assert_eq!(desc.to_string(), "render1:5000");
    }

    #[test]
    fn parse_default_port() {
        let desc = "10.0.0.2".parse::<ConnectionDescription>().unwrap();
        assert_eq!(desc.port, DEFAULT_PORT);
        assert_eq!(desc.address(), "10.0.0.2:4242");
    }

    #[test]
    fn parse_invalid() {
        assert!("host:port".parse::<ConnectionDescription>().is_err());
        assert!("".parse::<ConnectionDescription>().is_err());
    }

    #[test]
    fn empty_host_binds_any() {
        let desc = ConnectionDescription::tcp("", 0);
        assert_eq!(desc.address(), "0.0.0.0:0");
    }
}
