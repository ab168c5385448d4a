//! A fresh browser-like global scope per test.
//!
//! Each [`Scope`] is its own QuickJS context on the host runtime, bootstrapped
//! with a small document model (`window`, `document`, `location`, `navigator`,
//! elements and events), console output routed to `tracing`, and wall-clock
//! timers. Script elements with a `src` are fetched through the caller's
//! [`ResourceLoader`] when they get connected to the document.

use crate::convert::caught_to_error;
use crate::error::{Error, Result};
use crate::host::Host;
use crate::scheduler::{ClockHandle, SystemClock, TimerQueue};
use crate::timer_bridge::{TIMER_FUNCTIONS, TimerBridge};
use rquickjs::context::EvalOptions;
use rquickjs::function::Func;
use rquickjs::{Context, Ctx, Function, Object};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use url::Url;

const SCOPE_FILE: &str = "<scope>";
const TIMER_FILE: &str = "<timer>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Script,
}

/// A request for an external resource, addressed by its resolved URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRequest {
    pub url: Url,
    pub kind: ResourceKind,
}

/// Receives the outcome of a resource request. Must be invoked before the
/// loader returns; scripts are loaded synchronously.
pub type ResourceCallback = Box<dyn FnOnce(Result<String>)>;

pub type ResourceLoader = Rc<dyn Fn(&ResourceRequest, ResourceCallback)>;

pub type CloseHook = Box<dyn FnOnce()>;

/// Which script handling the scope performs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScopeFeatures {
    /// Request `<script src>` resources through the loader.
    pub fetch_external_scripts: bool,
    /// Execute script content (fetched or inline).
    pub process_external_scripts: bool,
}

impl ScopeFeatures {
    pub const fn scripts() -> Self {
        Self {
            fetch_external_scripts: true,
            process_external_scripts: true,
        }
    }
}

pub struct Scope {
    timers: Option<TimerBridge>,
    errors: Rc<RefCell<Vec<Error>>>,
    close_hooks: Vec<CloseHook>,
    url: Url,
    context: Option<Context>,
    host: Rc<Host>,
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("url", &self.url.as_str())
            .field("closed", &self.is_closed())
            .field("reported_errors", &self.errors.borrow().len())
            .finish_non_exhaustive()
    }
}

impl Scope {
    pub(crate) fn new(
        host: Rc<Host>,
        url: Url,
        loader: ResourceLoader,
        features: ScopeFeatures,
    ) -> Result<Self> {
        let context = Context::full(host.runtime())?;
        let errors: Rc<RefCell<Vec<Error>>> = Rc::default();

        let timers = context.with(|ctx| -> Result<TimerBridge> {
            let natives = Object::new(ctx.clone())?;
            natives.set("location", location_parts(&ctx, &url)?)?;
            natives.set("fetchScripts", features.fetch_external_scripts)?;
            natives.set("processScripts", features.process_external_scripts)?;
            let base = url.clone();
            natives.set(
                "resolve",
                Func::from(move |src: String| -> String {
                    base.join(&src).map_or(src, |resolved| resolved.to_string())
                }),
            )?;
            natives.set(
                "loadScript",
                script_loader(
                    &ctx,
                    url.clone(),
                    loader,
                    Rc::clone(&errors),
                    features.process_external_scripts,
                )?,
            )?;
            natives.set(
                "log",
                Func::from(|level: String, message: String| {
                    tracing::info!(event = "scope.console", level = %level, "{message}");
                }),
            )?;

            let bootstrap: Function<'_> = ctx.eval(DOM_JS)?;
            bootstrap
                .call::<_, ()>((ctx.globals(), natives))
                .map_err(|err| caught_to_error(&ctx, err, SCOPE_FILE))?;

            let queue =
                TimerQueue::with_ids(ClockHandle::new(Arc::new(SystemClock)), host.timer_ids());
            let timers = TimerBridge::new(&ctx, Rc::new(RefCell::new(queue)))?;
            timers.install(&ctx, &ctx.globals(), &TIMER_FUNCTIONS)?;
            Ok(timers)
        })?;

        tracing::debug!(event = "scope.create", url = %url, "Created global scope");
        Ok(Self {
            timers: Some(timers),
            errors,
            close_hooks: Vec::new(),
            url,
            context: Some(context),
            host,
        })
    }

    pub const fn url(&self) -> &Url {
        &self.url
    }

    pub const fn host(&self) -> &Rc<Host> {
        &self.host
    }

    pub const fn is_closed(&self) -> bool {
        self.context.is_none()
    }

    /// Run `f` inside this scope's context.
    pub fn with<F, R>(&self, f: F) -> Result<R>
    where
        F: for<'js> FnOnce(Ctx<'js>) -> R,
    {
        let context = self
            .context
            .as_ref()
            .ok_or_else(|| Error::scope(format!("Scope for {} is closed", self.url)))?;
        Ok(context.with(f))
    }

    /// Flip `navigator.onLine`.
    pub fn set_online(&self, online: bool) -> Result<()> {
        self.with(|ctx| -> Result<()> {
            let navigator: Object<'_> = ctx.globals().get("navigator")?;
            navigator.set("onLine", online)?;
            Ok(())
        })?
    }

    /// Fire the wall-clock timers that are due.
    pub fn run_due_timers(&self) -> Result<usize> {
        let Some(timers) = &self.timers else {
            return Ok(0);
        };
        self.with(|ctx| -> Result<usize> {
            let mut fired = 0;
            loop {
                let next = timers.queue().borrow_mut().pop_due();
                let Some(due) = next else {
                    return Ok(fired);
                };
                timers
                    .fire_timer(&ctx, &due)
                    .map_err(|err| caught_to_error(&ctx, err, TIMER_FILE))?;
                fired += 1;
            }
        })?
    }

    pub fn pending_timer_count(&self) -> usize {
        self.timers
            .as_ref()
            .map_or(0, |timers| timers.queue().borrow().len())
    }

    /// Messages of the errors reported on this scope's error channel.
    pub fn reported_errors(&self) -> Vec<String> {
        self.errors.borrow().iter().map(ToString::to_string).collect()
    }

    pub fn take_reported_errors(&self) -> Vec<Error> {
        std::mem::take(&mut *self.errors.borrow_mut())
    }

    pub fn on_close(&mut self, hook: impl FnOnce() + 'static) {
        self.close_hooks.push(Box::new(hook));
    }

    /// Clear pending timers, run the close hooks and release the context.
    /// Later calls do nothing.
    pub fn close(&mut self) {
        let Some(context) = self.context.take() else {
            return;
        };
        if let Some(timers) = self.timers.take() {
            if let Err(err) = context.with(|ctx| timers.clear_all(&ctx)) {
                tracing::warn!(event = "scope.close", url = %self.url, error = %err, "Failed to clear timers");
            }
        }
        for hook in self.close_hooks.drain(..) {
            hook();
        }
        drop(context);
        tracing::debug!(event = "scope.close", url = %self.url, "Closed global scope");
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        self.close();
    }
}

fn location_parts<'js>(ctx: &Ctx<'js>, url: &Url) -> rquickjs::Result<Object<'js>> {
    let parts = Object::new(ctx.clone())?;
    let host = match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_string(),
        (None, _) => String::new(),
    };
    parts.set("href", url.as_str())?;
    parts.set("origin", url.origin().ascii_serialization())?;
    parts.set("protocol", format!("{}:", url.scheme()))?;
    parts.set("host", host)?;
    parts.set("hostname", url.host_str().unwrap_or_default())?;
    parts.set("port", url.port().map(|port| port.to_string()).unwrap_or_default())?;
    parts.set("pathname", url.path())?;
    parts.set("search", url.query().map(|query| format!("?{query}")).unwrap_or_default())?;
    parts.set("hash", url.fragment().map(|hash| format!("#{hash}")).unwrap_or_default())?;
    Ok(parts)
}

/// Native behind `<script src>`: resolve, ask the loader, evaluate.
///
/// Returns `false` when the resource could not be obtained; the failure is
/// recorded on the scope's error channel. Exceptions thrown by the fetched
/// script propagate to whoever connected the element.
fn script_loader<'js>(
    ctx: &Ctx<'js>,
    base: Url,
    loader: ResourceLoader,
    errors: Rc<RefCell<Vec<Error>>>,
    execute: bool,
) -> rquickjs::Result<Function<'js>> {
    let report = move |err: Error| {
        tracing::warn!(event = "scope.resource.error", error = %err, "Could not load script");
        errors.borrow_mut().push(err);
    };

    Function::new(ctx.clone(), move |ctx: Ctx<'js>, src: String| -> rquickjs::Result<bool> {
        let url = match base.join(&src) {
            Ok(url) => url,
            Err(err) => {
                report(Error::from(err));
                return Ok(false);
            }
        };
        let request = ResourceRequest {
            url,
            kind: ResourceKind::Script,
        };

        let slot: Rc<RefCell<Option<Result<String>>>> = Rc::default();
        let reply = Rc::clone(&slot);
        loader(
            &request,
            Box::new(move |result| {
                *reply.borrow_mut() = Some(result);
            }),
        );
        let outcome = slot.borrow_mut().take();
        let source = match outcome {
            Some(Ok(source)) => source,
            Some(Err(err)) => {
                report(err);
                return Ok(false);
            }
            None => {
                report(Error::scope(format!(
                    "Resource loader did not answer the request for {}",
                    request.url
                )));
                return Ok(false);
            }
        };

        tracing::debug!(event = "scope.resource.load", url = %request.url, bytes = source.len(), "Loaded script");
        if execute {
            let mut options = EvalOptions::default();
            options.strict = false;
            options.filename = Some(request.url.to_string());
            ctx.eval_with_options::<(), _>(source, options)?;
        }
        Ok(true)
    })
}

const DOM_JS: &str = r#"
(function (global, natives) {
  'use strict';

  const listenerMap = new WeakMap();
  const attributeMap = new WeakMap();
  const startedScripts = new WeakSet();

  function listenersOf(target) {
    let map = listenerMap.get(target);
    if (map === undefined) {
      map = new Map();
      listenerMap.set(target, map);
    }
    return map;
  }

  class Event {
    constructor(type, init) {
      this.type = String(type);
      this.bubbles = !!(init && init.bubbles);
      this.cancelable = !!(init && init.cancelable);
      this.defaultPrevented = false;
      this.target = null;
      this.currentTarget = null;
    }
    preventDefault() {
      if (this.cancelable) this.defaultPrevented = true;
    }
  }

  class EventTarget {
    addEventListener(type, listener) {
      if (listener == null) return;
      const map = listenersOf(this);
      if (!map.has(type)) map.set(type, []);
      const list = map.get(type);
      if (!list.includes(listener)) list.push(listener);
    }
    removeEventListener(type, listener) {
      const list = listenersOf(this).get(type);
      if (!list) return;
      const index = list.indexOf(listener);
      if (index !== -1) list.splice(index, 1);
    }
    dispatchEvent(event) {
      if (event.target === null) event.target = this;
      event.currentTarget = this;
      const handler = this['on' + event.type];
      if (typeof handler === 'function') handler.call(this, event);
      const list = listenersOf(this).get(event.type);
      if (list) {
        for (const listener of list.slice()) {
          if (typeof listener === 'function') listener.call(this, event);
          else listener.handleEvent(event);
        }
      }
      return !event.defaultPrevented;
    }
  }

  class Node extends EventTarget {
    constructor(nodeName, ownerDocument) {
      super();
      this.nodeName = nodeName;
      this.ownerDocument = ownerDocument;
      this.parentNode = null;
      this.childNodes = [];
    }
    get firstChild() { return this.childNodes[0] || null; }
    get lastChild() { return this.childNodes[this.childNodes.length - 1] || null; }
    get isConnected() {
      let node = this;
      while (node.parentNode !== null) node = node.parentNode;
      return node === document;
    }
    get textContent() {
      return this.childNodes.map((child) => child.textContent).join('');
    }
    set textContent(value) {
      for (const child of this.childNodes) child.parentNode = null;
      this.childNodes = [];
      if (value != null && value !== '') this.appendChild(new Text(value, this.ownerDocument));
    }
    appendChild(child) {
      if (!(child instanceof Node)) {
        throw new TypeError("Failed to execute 'appendChild' on 'Node': parameter 1 is not of type 'Node'.");
      }
      if (child.parentNode !== null) child.parentNode.removeChild(child);
      this.childNodes.push(child);
      child.parentNode = this;
      if (child.isConnected) connect(child);
      return child;
    }
    removeChild(child) {
      const index = this.childNodes.indexOf(child);
      if (index === -1) {
        throw new Error("Failed to execute 'removeChild' on 'Node': The node to be removed is not a child of this node.");
      }
      this.childNodes.splice(index, 1);
      child.parentNode = null;
      return child;
    }
    contains(other) {
      for (let node = other; node; node = node.parentNode) {
        if (node === this) return true;
      }
      return false;
    }
  }

  class Text extends Node {
    constructor(data, ownerDocument) {
      super('#text', ownerDocument);
      this.data = String(data);
    }
    get textContent() { return this.data; }
    set textContent(value) { this.data = String(value); }
  }

  class Element extends Node {
    constructor(tagName, ownerDocument) {
      super(String(tagName).toUpperCase(), ownerDocument);
      attributeMap.set(this, new Map());
    }
    get tagName() { return this.nodeName; }
    get localName() { return this.nodeName.toLowerCase(); }
    get children() { return this.childNodes.filter((node) => node instanceof Element); }
    get id() { return this.getAttribute('id') || ''; }
    set id(value) { this.setAttribute('id', value); }
    setAttribute(name, value) { attributeMap.get(this).set(String(name).toLowerCase(), String(value)); }
    getAttribute(name) {
      const value = attributeMap.get(this).get(String(name).toLowerCase());
      return value === undefined ? null : value;
    }
    hasAttribute(name) { return attributeMap.get(this).has(String(name).toLowerCase()); }
    removeAttribute(name) { attributeMap.get(this).delete(String(name).toLowerCase()); }
  }

  class HTMLScriptElement extends Element {
    constructor(ownerDocument) { super('script', ownerDocument); }
    get src() {
      const value = this.getAttribute('src');
      return value === null ? '' : natives.resolve(value);
    }
    set src(value) { this.setAttribute('src', value); }
    get text() { return this.textContent; }
    set text(value) { this.textContent = value; }
  }

  class Document extends Node {
    constructor() {
      super('#document', null);
      this.documentElement = new Element('html', this);
      this.head = new Element('head', this);
      this.body = new Element('body', this);
      this.appendChild(this.documentElement);
      this.documentElement.appendChild(this.head);
      this.documentElement.appendChild(this.body);
    }
    get URL() { return location.href; }
    get documentURI() { return location.href; }
    get location() { return location; }
    get readyState() { return 'complete'; }
    createElement(tagName) {
      const name = String(tagName).toLowerCase();
      return name === 'script' ? new HTMLScriptElement(this) : new Element(name, this);
    }
    createTextNode(data) { return new Text(data, this); }
    getElementById(id) {
      const pending = [this.documentElement];
      while (pending.length > 0) {
        const node = pending.shift();
        if (node instanceof Element && node.id === id) return node;
        pending.push(...node.childNodes);
      }
      return null;
    }
  }

  function connect(node) {
    if (node instanceof HTMLScriptElement) prepareScript(node);
    for (const child of node.childNodes.slice()) connect(child);
  }

  function prepareScript(script) {
    if (startedScripts.has(script)) return;
    if (script.hasAttribute('src')) {
      if (!natives.fetchScripts) return;
      startedScripts.add(script);
      const loaded = natives.loadScript(script.getAttribute('src'));
      script.dispatchEvent(new Event(loaded ? 'load' : 'error'));
      return;
    }
    const source = script.text;
    if (!natives.processScripts || source === '') return;
    startedScripts.add(script);
    (0, eval)(source);
  }

  function format(args) {
    return args.map((arg) => {
      if (typeof arg === 'string') return arg;
      if (arg instanceof Error) return arg.stack || String(arg);
      try {
        const json = JSON.stringify(arg);
        return json === undefined ? String(arg) : json;
      } catch (_) {
        return String(arg);
      }
    }).join(' ');
  }

  const location = {
    ...natives.location,
    toString() { return this.href; },
  };
  const navigator = {
    userAgent: 'Mozilla/5.0 (pijs) QuickJS',
    language: 'en-US',
    languages: ['en-US'],
    cookieEnabled: false,
    onLine: false,
  };
  let document = null;
  document = new Document();

  const windowEvents = new EventTarget();
  Object.assign(global, {
    window: global,
    self: global,
    document,
    location,
    navigator,
    Event,
    EventTarget,
    Node,
    Text,
    Element,
    HTMLElement: Element,
    HTMLScriptElement,
    Document,
    addEventListener: windowEvents.addEventListener.bind(windowEvents),
    removeEventListener: windowEvents.removeEventListener.bind(windowEvents),
    dispatchEvent: windowEvents.dispatchEvent.bind(windowEvents),
  });

  if (typeof global.console === 'undefined') {
    global.console = {
      log: (...args) => natives.log('log', format(args)),
      info: (...args) => natives.log('info', format(args)),
      debug: (...args) => natives.log('debug', format(args)),
      warn: (...args) => natives.log('warn', format(args)),
      error: (...args) => natives.log('error', format(args)),
    };
  }
})
"#;
