//! PAC script evaluation on an embedded JavaScript engine.

use std::cell::RefCell;
use std::net::{IpAddr, Ipv4Addr, ToSocketAddrs, UdpSocket};
use std::sync::Arc;

use boa_engine::{
  js_string, native_function::NativeFunction, property::PropertyKey, Context, JsObject, JsResult,
  JsValue, Source,
};

use crate::builtins::{self, PacClock};
use crate::{Error, Result};

/// DNS facade used by `dnsResolve`, `isResolvable`, `isInNet` and
/// `myIpAddress`. Implementations must not block for longer than an
/// ordinary system lookup; evaluation happens on a blocking-friendly
/// thread.
pub trait DnsLookup: Send + Sync {
  /// Resolve a hostname to its IPv4 addresses, empty on failure.
  fn lookup_ipv4(&self, host: &str) -> Vec<Ipv4Addr>;

  /// The machine's own IPv4 addresses, loopback included.
  fn local_ipv4(&self) -> Vec<Ipv4Addr>;
}

/// System resolver backed by the platform's lookup machinery.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemDns;

impl DnsLookup for SystemDns {
  fn lookup_ipv4(&self, host: &str) -> Vec<Ipv4Addr> {
    match (host, 0u16).to_socket_addrs() {
      Ok(addrs) => addrs
        .filter_map(|a| match a.ip() {
          IpAddr::V4(ip) => Some(ip),
          IpAddr::V6(_) => None,
        })
        .collect(),
      Err(_) => Vec::new(),
    }
  }

  fn local_ipv4(&self) -> Vec<Ipv4Addr> {
    // A connected UDP socket picks the outbound interface without sending
    // any packet.
    let probe = || -> std::io::Result<Ipv4Addr> {
      let sock = UdpSocket::bind("0.0.0.0:0")?;
      sock.connect("8.8.8.8:53")?;
      match sock.local_addr()?.ip() {
        IpAddr::V4(ip) => Ok(ip),
        IpAddr::V6(_) => Err(std::io::Error::other("ipv6 local address")),
      }
    };
    match probe() {
      Ok(ip) => vec![ip],
      Err(_) => Vec::new(),
    }
  }
}

/// Fixed-answer resolver for tests and hermetic setups.
#[derive(Debug, Default, Clone)]
pub struct StaticDns {
  hosts: std::collections::HashMap<String, Vec<Ipv4Addr>>,
  local: Vec<Ipv4Addr>,
}

impl StaticDns {
  /// Map `host` to the given addresses.
  pub fn host(mut self, host: &str, addrs: &[Ipv4Addr]) -> Self {
    self.hosts.insert(host.to_owned(), addrs.to_vec());
    self
  }

  /// Answers for `myIpAddress`.
  pub fn local(mut self, addrs: &[Ipv4Addr]) -> Self {
    self.local = addrs.to_vec();
    self
  }
}

impl DnsLookup for StaticDns {
  fn lookup_ipv4(&self, host: &str) -> Vec<Ipv4Addr> {
    self.hosts.get(host).cloned().unwrap_or_default()
  }

  fn local_ipv4(&self) -> Vec<Ipv4Addr> {
    self.local.clone()
  }
}

// The engine's native functions are plain fn pointers, so the lookup used
// by the current evaluation travels through thread-local storage.
thread_local! {
  static CURRENT_LOOKUP: RefCell<Option<Arc<dyn DnsLookup>>> = const { RefCell::new(None) };
}

fn with_current_lookup<T>(f: impl FnOnce(&Arc<dyn DnsLookup>) -> T) -> Option<T> {
  CURRENT_LOOKUP.with(|l| l.borrow().as_ref().map(f))
}

/// Evaluates `FindProxyForURL(url, host)` from a PAC script.
///
/// The source is compiled once at construction to validate it; each call to
/// [`ProxyResolver::find_proxy_for_url`] then runs in a fresh engine
/// context, which keeps evaluation safe under concurrency.
pub struct ProxyResolver {
  source: String,
  lookup: Arc<dyn DnsLookup>,
}

impl ProxyResolver {
  /// Compile and validate a PAC script with the system resolver.
  pub fn new(source: &str) -> Result<Self> {
    Self::with_lookup(source, Arc::new(SystemDns))
  }

  /// Compile and validate a PAC script with a custom resolver.
  pub fn with_lookup(source: &str, lookup: Arc<dyn DnsLookup>) -> Result<Self> {
    let mut context = Context::default();
    context
      .eval(Source::from_bytes(source.as_bytes()))
      .map_err(|e| Error::Compile(e.to_string()))?;

    let global = context.global_object();
    match global.get(js_string!("FindProxyForURL"), &mut context) {
      Ok(v) if v.is_callable() => {}
      _ => return Err(Error::MissingFindProxyForURL),
    }

    Ok(Self {
      source: source.to_owned(),
      lookup,
    })
  }

  /// Evaluate the script for one request and return the raw proxy string.
  pub fn find_proxy_for_url(&self, url: &str, host: &str) -> Result<String> {
    CURRENT_LOOKUP.with(|l| *l.borrow_mut() = Some(self.lookup.clone()));
    let result = self.evaluate(url, host);
    CURRENT_LOOKUP.with(|l| *l.borrow_mut() = None);
    if let Err(e) = &result {
      tracing::debug!("FindProxyForURL({url}, {host}) failed: {e}");
    }
    result
  }

  fn evaluate(&self, url: &str, host: &str) -> Result<String> {
    let mut context = Context::default();
    register_builtins(&mut context)?;

    context
      .eval(Source::from_bytes(self.source.as_bytes()))
      .map_err(|e| Error::Evaluate(e.to_string()))?;

    let global = context.global_object();
    let func = global
      .get(js_string!("FindProxyForURL"), &mut context)
      .map_err(|e| Error::Evaluate(e.to_string()))?;

    let result = func
      .as_callable()
      .ok_or(Error::MissingFindProxyForURL)?
      .call(
        &JsValue::undefined(),
        &[
          JsValue::from(js_string!(url)),
          JsValue::from(js_string!(host)),
        ],
        &mut context,
      )
      .map_err(|e| Error::Evaluate(e.to_string()))?;

    result
      .as_string()
      .map(|s| s.to_std_string_escaped())
      .ok_or(Error::NonStringReturn)
  }
}

impl std::fmt::Debug for ProxyResolver {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ProxyResolver")
      .field("source_len", &self.source.len())
      .finish()
  }
}

type NativeFn = fn(&JsValue, &[JsValue], &mut Context) -> JsResult<JsValue>;

fn register(global: &JsObject, name: &str, func: NativeFn, context: &mut Context) -> Result<()> {
  global
    .set(
      PropertyKey::from(js_string!(name)),
      NativeFunction::from_fn_ptr(func).to_js_function(context.realm()),
      false,
      context,
    )
    .map(|_| ())
    .map_err(|e| Error::Evaluate(format!("failed to register {name}: {e}")))
}

fn register_builtins(context: &mut Context) -> Result<()> {
  let global = context.global_object();
  register(&global, "isPlainHostName", is_plain_host_name_fn, context)?;
  register(&global, "dnsDomainIs", dns_domain_is_fn, context)?;
  register(&global, "localHostOrDomainIs", local_host_or_domain_is_fn, context)?;
  register(&global, "isResolvable", is_resolvable_fn, context)?;
  register(&global, "isInNet", is_in_net_fn, context)?;
  register(&global, "dnsResolve", dns_resolve_fn, context)?;
  register(&global, "myIpAddress", my_ip_address_fn, context)?;
  register(&global, "dnsDomainLevels", dns_domain_levels_fn, context)?;
  register(&global, "shExpMatch", sh_exp_match_fn, context)?;
  register(&global, "weekdayRange", weekday_range_fn, context)?;
  register(&global, "dateRange", date_range_fn, context)?;
  register(&global, "timeRange", time_range_fn, context)?;
  Ok(())
}

fn arg_string(args: &[JsValue], n: usize) -> Option<String> {
  args.get(n).and_then(|v| v.as_string()).map(|s| s.to_std_string_escaped())
}

/// Stringify every argument the way the range predicates expect: strings
/// pass through, numbers render as integers.
fn range_args(args: &[JsValue]) -> Option<Vec<String>> {
  let mut out = Vec::with_capacity(args.len());
  for v in args {
    if let Some(s) = v.as_string() {
      out.push(s.to_std_string_escaped());
    } else if let Some(n) = v.as_number() {
      out.push(format!("{}", n as i64));
    } else {
      return None;
    }
  }
  Some(out)
}

fn is_plain_host_name_fn(_: &JsValue, args: &[JsValue], _: &mut Context) -> JsResult<JsValue> {
  let Some(host) = arg_string(args, 0) else {
    return Ok(JsValue::from(false));
  };
  Ok(JsValue::from(builtins::is_plain_host_name(&host)))
}

fn dns_domain_is_fn(_: &JsValue, args: &[JsValue], _: &mut Context) -> JsResult<JsValue> {
  let (Some(host), Some(domain)) = (arg_string(args, 0), arg_string(args, 1)) else {
    return Ok(JsValue::from(false));
  };
  Ok(JsValue::from(builtins::dns_domain_is(&host, &domain)))
}

fn local_host_or_domain_is_fn(_: &JsValue, args: &[JsValue], _: &mut Context) -> JsResult<JsValue> {
  let (Some(host), Some(hostdom)) = (arg_string(args, 0), arg_string(args, 1)) else {
    return Ok(JsValue::from(false));
  };
  Ok(JsValue::from(builtins::local_host_or_domain_is(&host, &hostdom)))
}

fn is_resolvable_fn(_: &JsValue, args: &[JsValue], _: &mut Context) -> JsResult<JsValue> {
  let Some(host) = arg_string(args, 0) else {
    return Ok(JsValue::from(false));
  };
  let resolved = with_current_lookup(|l| !l.lookup_ipv4(&host).is_empty()).unwrap_or(false);
  Ok(JsValue::from(resolved))
}

fn is_in_net_fn(_: &JsValue, args: &[JsValue], _: &mut Context) -> JsResult<JsValue> {
  let (Some(host), Some(pattern), Some(mask)) = (
    arg_string(args, 0),
    arg_string(args, 1),
    arg_string(args, 2),
  ) else {
    return Ok(JsValue::from(false));
  };

  // Hostnames resolve before the masked comparison; literals pass through.
  let addr = if host.parse::<Ipv4Addr>().is_ok() {
    Some(host)
  } else {
    with_current_lookup(|l| l.lookup_ipv4(&host))
      .unwrap_or_default()
      .first()
      .map(|ip| ip.to_string())
  };
  let Some(addr) = addr else {
    return Ok(JsValue::from(false));
  };
  Ok(JsValue::from(builtins::is_in_net(&addr, &pattern, &mask)))
}

fn dns_resolve_fn(_: &JsValue, args: &[JsValue], _: &mut Context) -> JsResult<JsValue> {
  let Some(host) = arg_string(args, 0) else {
    return Ok(JsValue::undefined());
  };
  let first = with_current_lookup(|l| l.lookup_ipv4(&host))
    .unwrap_or_default()
    .into_iter()
    .next();
  match first {
    Some(ip) => Ok(JsValue::from(js_string!(ip.to_string()))),
    None => Ok(JsValue::null()),
  }
}

fn my_ip_address_fn(_: &JsValue, _: &[JsValue], _: &mut Context) -> JsResult<JsValue> {
  let ip = with_current_lookup(|l| l.local_ipv4())
    .unwrap_or_default()
    .into_iter()
    .find(|ip| !ip.is_loopback())
    .unwrap_or(Ipv4Addr::LOCALHOST);
  Ok(JsValue::from(js_string!(ip.to_string())))
}

fn dns_domain_levels_fn(_: &JsValue, args: &[JsValue], _: &mut Context) -> JsResult<JsValue> {
  let Some(host) = arg_string(args, 0) else {
    return Ok(JsValue::from(0));
  };
  Ok(JsValue::from(builtins::dns_domain_levels(&host)))
}

fn sh_exp_match_fn(_: &JsValue, args: &[JsValue], _: &mut Context) -> JsResult<JsValue> {
  let (Some(s), Some(exp)) = (arg_string(args, 0), arg_string(args, 1)) else {
    return Ok(JsValue::from(false));
  };
  Ok(JsValue::from(builtins::sh_exp_match(&s, &exp)))
}

fn weekday_range_fn(_: &JsValue, args: &[JsValue], _: &mut Context) -> JsResult<JsValue> {
  let Some(args) = range_args(args) else {
    return Ok(JsValue::from(false));
  };
  Ok(JsValue::from(builtins::weekday_range(&args, PacClock::now())))
}

fn date_range_fn(_: &JsValue, args: &[JsValue], _: &mut Context) -> JsResult<JsValue> {
  let Some(args) = range_args(args) else {
    return Ok(JsValue::from(false));
  };
  Ok(JsValue::from(builtins::date_range(&args, PacClock::now())))
}

fn time_range_fn(_: &JsValue, args: &[JsValue], _: &mut Context) -> JsResult<JsValue> {
  let Some(args) = range_args(args) else {
    return Ok(JsValue::from(false));
  };
  Ok(JsValue::from(builtins::time_range(&args, PacClock::now())))
}
