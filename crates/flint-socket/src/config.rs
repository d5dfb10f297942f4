use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SocketError;

/// 引擎内部缓冲策略的可调常量。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 预读余量、解密批量等阈值依赖吞吐/延迟实测，不应写死在代码里；
/// - 集中在一个结构中便于从 TOML 覆盖，也便于测试用极小值放大边界行为。
///
/// ## 契约 (What)
/// - `read_chunk_size`：明文模式下单次 `try_read` 的上限，必须大于 0；
/// - `read_ahead_limit`：没有挂起读操作时，预读缓冲允许积累的上限（背压阈值）；
/// - `tls_read_margin`：TLS 模式下读密文的余量，单次读取提示为“上次读取量 + 余量”；
/// - `tls_read_max`：TLS 单次读取提示的封顶值；
/// - `tls_outbound_high_water`：待发送密文超过该值时暂停加密新的明文；
/// - `buffer_shrink_threshold`：内部缓冲读游标越过该位置时压缩。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineTuning {
    pub read_chunk_size: usize,
    pub read_ahead_limit: usize,
    pub tls_read_margin: usize,
    pub tls_read_max: usize,
    pub tls_outbound_high_water: usize,
    pub buffer_shrink_threshold: usize,
}

impl Default for EngineTuning {
    fn default() -> Self {
        Self {
            read_chunk_size: 32 * 1024,
            read_ahead_limit: 1024 * 1024,
            tls_read_margin: 1024,
            tls_read_max: 64 * 1024,
            tls_outbound_high_water: 64 * 1024,
            buffer_shrink_threshold: flint_buffer::DEFAULT_SHRINK_THRESHOLD,
        }
    }
}

impl EngineTuning {
    fn validate(&self) -> Result<(), SocketError> {
        if self.read_chunk_size == 0 {
            return Err(SocketError::BadConfig(
                "tuning.read_chunk_size must be positive".into(),
            ));
        }
        if self.tls_read_max == 0 || self.tls_read_margin > self.tls_read_max {
            return Err(SocketError::BadConfig(
                "tuning.tls_read_margin must not exceed a positive tuning.tls_read_max".into(),
            ));
        }
        if self.tls_outbound_high_water == 0 || self.buffer_shrink_threshold == 0 {
            return Err(SocketError::BadConfig(
                "tuning thresholds must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// 单个套接字的配置：地址族开关、偏好、建连超时与引擎调优项。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 将“启用哪些地址族、双栈同时就绪时偏好哪一个”等策略显式配置化，替代散落在调用点的布尔参数；
/// - 支持以 TOML 片段加载，未出现的字段回落到默认值。
///
/// ## 契约 (What)
/// - 默认：IPv4/IPv6 均启用、偏好 IPv4、无建连超时、不设置 `TCP_NODELAY`；
/// - [`SocketConfig::validate`] 在两个地址族都被禁用或调优项非法时返回 [`SocketError::BadConfig`]；
/// - `connect_timeout` 在 TOML 中以毫秒表示（`connect_timeout_ms`），`0` 等价于不设超时。
///
/// ## 注意事项 (Trade-offs)
/// - `prefer_ipv4` 只在同一轮轮询中两个地址族同时成功时生效，不会让偏好的地址族“先跑”。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    ipv4_enabled: bool,
    ipv6_enabled: bool,
    prefer_ipv4: bool,
    #[serde(rename = "connect_timeout_ms", with = "optional_millis")]
    connect_timeout: Option<Duration>,
    nodelay: bool,
    tuning: EngineTuning,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl SocketConfig {
    pub fn new() -> Self {
        Self {
            ipv4_enabled: true,
            ipv6_enabled: true,
            prefer_ipv4: true,
            connect_timeout: None,
            nodelay: false,
            tuning: EngineTuning::default(),
        }
    }

    /// 从 TOML 文本解析配置并立即校验。
    pub fn from_toml_str(raw: &str) -> Result<Self, SocketError> {
        let config: Self = toml::from_str(raw)
            .map_err(|err| SocketError::BadConfig(format!("invalid socket config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// 序列化为 TOML 文本，便于落盘或日志输出。
    pub fn to_toml_string(&self) -> Result<String, SocketError> {
        toml::to_string(self)
            .map_err(|err| SocketError::BadConfig(format!("unserializable socket config: {err}")))
    }

    pub fn with_ipv4_enabled(mut self, enabled: bool) -> Self {
        self.ipv4_enabled = enabled;
        self
    }

    pub fn with_ipv6_enabled(mut self, enabled: bool) -> Self {
        self.ipv6_enabled = enabled;
        self
    }

    pub fn with_prefer_ipv4(mut self, prefer: bool) -> Self {
        self.prefer_ipv4 = prefer;
        self
    }

    /// 设置整体建连超时，`None` 或零时长表示不限时。
    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout.filter(|timeout| !timeout.is_zero());
        self
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    pub fn with_tuning(mut self, tuning: EngineTuning) -> Self {
        self.tuning = tuning;
        self
    }

    pub fn ipv4_enabled(&self) -> bool {
        self.ipv4_enabled
    }

    pub fn ipv6_enabled(&self) -> bool {
        self.ipv6_enabled
    }

    pub fn prefer_ipv4(&self) -> bool {
        self.prefer_ipv4
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout
    }

    pub fn nodelay(&self) -> bool {
        self.nodelay
    }

    pub fn tuning(&self) -> &EngineTuning {
        &self.tuning
    }

    /// 校验地址族开关与调优项。
    pub fn validate(&self) -> Result<(), SocketError> {
        if !self.ipv4_enabled && !self.ipv6_enabled {
            return Err(SocketError::BadConfig(
                "both IPv4 and IPv6 are disabled".into(),
            ));
        }
        self.tuning.validate()
    }

    /// 判断某个地址族是否被允许。
    pub(crate) fn allows(&self, address: &std::net::SocketAddr) -> bool {
        if address.is_ipv4() {
            self.ipv4_enabled
        } else {
            self.ipv6_enabled
        }
    }
}

/// 监听配置：绑定的接口与端口。
///
/// `interface` 为 `None` 时监听所有接口；`"localhost"`/`"loopback"` 映射为
/// `127.0.0.1` 与 `::1`；其余取值必须是 IP 字面量。端口 `0` 表示由内核挑选，且两个地址族
/// 共享第一次绑定拿到的端口。
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    interface: Option<String>,
    port: u16,
}

impl ListenConfig {
    pub fn new(port: u16) -> Self {
        Self {
            interface: None,
            port,
        }
    }

    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    pub fn interface(&self) -> Option<&str> {
        self.interface.as_deref()
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

mod optional_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(duration) => {
                let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
                serializer.serialize_u64(millis)
            }
            None => serializer.serialize_u64(0),
        }
    }

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok((millis > 0).then(|| Duration::from_millis(millis)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_overrides_only_named_fields() {
        let config = SocketConfig::from_toml_str(
            r#"
            ipv6_enabled = false
            connect_timeout_ms = 1500

            [tuning]
            read_chunk_size = 4096
            "#,
        )
        .expect("配置合法");
        assert!(config.ipv4_enabled());
        assert!(!config.ipv6_enabled());
        assert!(config.prefer_ipv4());
        assert_eq!(config.connect_timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(config.tuning().read_chunk_size, 4096);
        assert_eq!(
            config.tuning().tls_read_margin,
            EngineTuning::default().tls_read_margin
        );
    }

    #[test]
    fn disabling_both_families_is_rejected() {
        let error = SocketConfig::from_toml_str("ipv4_enabled = false\nipv6_enabled = false")
            .expect_err("两个地址族都禁用应当报错");
        assert!(matches!(error, SocketError::BadConfig(_)));
    }

    #[test]
    fn toml_round_trip_preserves_timeout() {
        let config = SocketConfig::new()
            .with_connect_timeout(Some(Duration::from_secs(2)))
            .with_nodelay(true);
        let raw = config.to_toml_string().expect("可序列化");
        let parsed = SocketConfig::from_toml_str(&raw).expect("可解析");
        assert_eq!(parsed, config);
    }

    #[test]
    fn zero_timeout_means_unbounded() {
        let config = SocketConfig::new().with_connect_timeout(Some(Duration::ZERO));
        assert_eq!(config.connect_timeout(), None);
        let parsed = SocketConfig::from_toml_str("connect_timeout_ms = 0").expect("可解析");
        assert_eq!(parsed.connect_timeout(), None);
    }
}
